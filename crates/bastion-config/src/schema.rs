//! Configuration section types.
//!
//! Every section rejects unknown fields and fills missing ones from its
//! `Default`. Durations are stored in milliseconds (`*_ms`) or seconds
//! (`*_secs`) and exposed as [`Duration`] through accessors.

use bastion_auth::JwtAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Service identity, used by tracing and logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Service name.
    pub name: String,
    /// Service version.
    pub version: String,
    /// Deployment environment (e.g., "production").
    pub environment: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "bastion".to_string(),
            version: "0.1.0".to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enable logging.
    pub enabled: bool,
    /// Filter directive (e.g., "info" or "bastion_auth=debug,info").
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Log span open and close events.
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            format: LogFormat::Json,
            span_events: false,
        }
    }
}

/// Metrics section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder.
    pub enabled: bool,
    /// Scrape endpoint address. Without one, no listener is started.
    pub listen_addr: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: None,
        }
    }
}

/// Recovery section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Capture a backtrace for recovered panics.
    pub capture_stack: bool,
    /// Upper bound for the logged backtrace, in bytes.
    pub max_stack_bytes: usize,
    /// Paths the stage ignores. A panic on a skipped path is not contained.
    pub skip_paths: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            capture_stack: true,
            max_stack_bytes: 8 * 1024,
            skip_paths: Vec::new(),
        }
    }
}

/// Sampling strategy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Sample every request.
    #[default]
    Always,
    /// Sample no request.
    Never,
    /// Sample with probability `rate`.
    Probabilistic,
    /// Sample at most `max_per_second` requests per second.
    RateLimiting,
    /// Sample with a load-adjusted probability in `[min_rate, max_rate]`.
    Adaptive,
}

/// Sampling section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingConfig {
    /// Strategy.
    pub strategy: SamplingStrategy,
    /// Probability for `probabilistic`, starting rate for `adaptive`.
    pub rate: f64,
    /// Budget for `rate_limiting`.
    pub max_per_second: u32,
    /// Lower bound for `adaptive`.
    pub min_rate: f64,
    /// Upper bound for `adaptive`.
    pub max_rate: f64,
    /// Emit `X-Sampling-Decision` on responses.
    pub emit_header: bool,
    /// Paths the stage ignores. A trailing `*` matches by prefix.
    pub skip_paths: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::Always,
            rate: 1.0,
            max_per_second: 100,
            min_rate: 0.01,
            max_rate: 1.0,
            emit_header: false,
            skip_paths: Vec::new(),
        }
    }
}

/// Tracing section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TracingConfig {
    /// Enable the Tracing stage.
    pub enabled: bool,
    /// Paths the stage ignores. A trailing `*` matches by prefix.
    pub skip_paths: Vec<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_paths: Vec::new(),
        }
    }
}

/// CORS section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Enable the CORS stage.
    pub enabled: bool,
    /// Allowed origins; `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Allowed methods.
    pub allowed_methods: Vec<String>,
    /// Allowed request headers.
    pub allowed_headers: Vec<String>,
    /// Response headers exposed to scripts.
    pub exposed_headers: Vec<String>,
    /// Send `Access-Control-Allow-Credentials: true`.
    pub allow_credentials: bool,
    /// Preflight cache lifetime in seconds.
    pub max_age_secs: Option<u64>,
    /// Paths the stage ignores. A trailing `*` matches by prefix.
    pub skip_paths: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: Vec::new(),
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .map(String::from)
                .to_vec(),
            allowed_headers: ["Content-Type", "Authorization", "X-Request-ID"]
                .map(String::from)
                .to_vec(),
            exposed_headers: ["X-Request-ID", "X-Trace-ID"].map(String::from).to_vec(),
            allow_credentials: false,
            max_age_secs: Some(3600),
            skip_paths: Vec::new(),
        }
    }
}

/// What the rate limiter keys buckets by.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    /// Client address.
    #[default]
    ClientIp,
    /// Value of `key_header`.
    Header,
    /// Authenticated user, falling back to client address.
    User,
    /// One bucket for everything.
    Global,
}

/// Rate limit section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Enable the rate-limit stage.
    pub enabled: bool,
    /// Requests admitted per window.
    pub requests_per_second: u32,
    /// Bucket capacity. Defaults to `requests_per_second`.
    pub burst: Option<u32>,
    /// Refill window in milliseconds.
    pub window_ms: u64,
    /// Bucket key.
    pub key: RateLimitKey,
    /// Header used when `key = "header"`.
    pub key_header: Option<String>,
    /// Paths the stage ignores. A trailing `*` matches by prefix.
    pub skip_paths: Vec<String>,
    /// Buckets idle this long are evicted. `None` keeps them forever.
    pub idle_eviction_ms: Option<u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100,
            burst: None,
            window_ms: 1000,
            key: RateLimitKey::ClientIp,
            key_header: None,
            skip_paths: vec!["/health".to_string()],
            idle_eviction_ms: Some(10 * 60 * 1000),
        }
    }
}

impl RateLimitConfig {
    /// Refill window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Idle eviction threshold.
    #[must_use]
    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_ms.map(Duration::from_millis)
    }
}

/// Circuit breaker section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Enable the circuit-breaker stage.
    pub enabled: bool,
    /// Breaker name guarding the handler.
    pub name: String,
    /// Failures that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close it.
    pub success_threshold: u32,
    /// Open duration before a probe, in milliseconds.
    pub timeout_ms: u64,
    /// Closed-state failure window, in milliseconds.
    pub timeout_window_ms: u64,
    /// Paths the stage ignores. A trailing `*` matches by prefix.
    pub skip_paths: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "upstream".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
            timeout_window_ms: 60_000,
            skip_paths: Vec::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Open duration before a probe.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Closed-state failure window.
    #[must_use]
    pub const fn timeout_window(&self) -> Duration {
        Duration::from_millis(self.timeout_window_ms)
    }
}

/// JWT section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct JwtSection {
    /// Enable the Authenticate stage.
    pub enabled: bool,
    /// Expected issuer.
    pub issuer: String,
    /// Expected audience.
    pub audience: String,
    /// Algorithm (HS256/384/512, RS256/384/512).
    pub algorithm: JwtAlgorithm,
    /// Shared secret for HS algorithms.
    pub secret: Option<String>,
    /// PEM private key for RS algorithms. Needed only to issue tokens.
    pub private_key_path: Option<PathBuf>,
    /// PEM public key for RS algorithms.
    pub public_key_path: Option<PathBuf>,
    /// Access-token lifetime.
    pub access_ttl_secs: u64,
    /// Refresh-token lifetime.
    pub refresh_ttl_secs: u64,
    /// Clock-skew tolerance.
    pub leeway_secs: u64,
    /// Paths that bypass authentication.
    pub skip_paths: Vec<String>,
    /// Paths where a missing or invalid token is tolerated.
    pub optional_paths: Vec<String>,
}

impl Default for JwtSection {
    fn default() -> Self {
        Self {
            enabled: false,
            issuer: "bastion".to_string(),
            audience: "bastion-api".to_string(),
            algorithm: JwtAlgorithm::Hs256,
            secret: None,
            private_key_path: None,
            public_key_path: None,
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            leeway_secs: 0,
            skip_paths: vec!["/health".to_string(), "/login".to_string()],
            optional_paths: Vec::new(),
        }
    }
}

/// One route policy.
///
/// Exactly one of `permission`, `any_roles` or `all_roles` must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RouteRule {
    /// Path, or prefix when it ends in `*`.
    pub path: String,
    /// Restrict to one method.
    pub method: Option<String>,
    /// Required `(resource, action)`, written `"resource:action"`.
    pub permission: Option<String>,
    /// The caller needs one of these roles.
    pub any_roles: Vec<String>,
    /// The caller needs all of these roles.
    pub all_roles: Vec<String>,
}

impl RouteRule {
    /// Splits `permission` into `(resource, action)`.
    #[must_use]
    pub fn permission_parts(&self) -> Option<(&str, &str)> {
        self.permission.as_deref()?.split_once(':')
    }
}

/// Authorization section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AuthorizationConfig {
    /// Enable the Authorize stage.
    pub enabled: bool,
    /// Seed the store with the default `admin`/`moderator`/`user` policy.
    pub default_policy: bool,
    /// Route policies, first match wins.
    pub routes: Vec<RouteRule>,
    /// Paths the stage ignores on top of `jwt.skip_paths`.
    pub skip_paths: Vec<String>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_policy: true,
            routes: Vec::new(),
            skip_paths: Vec::new(),
        }
    }
}

/// Timeout section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Enable the Timeout stage.
    pub enabled: bool,
    /// Deadline in milliseconds. `None` only honours cancellation.
    pub timeout_ms: Option<u64>,
    /// Paths the stage ignores. A trailing `*` matches by prefix.
    pub skip_paths: Vec<String>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: Some(30_000),
            skip_paths: Vec::new(),
        }
    }
}

impl TimeoutConfig {
    /// Deadline.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// One feature flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FlagRule {
    /// Flag name.
    pub name: String,
    /// Initial state.
    pub enabled: bool,
    /// Free-form description.
    pub description: String,
}

/// A path gated behind a flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GateRule {
    /// Path, or prefix when it ends in `*`.
    pub path: String,
    /// Flag that must be on.
    pub flag: String,
}

/// Feature gate section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FeaturesConfig {
    /// Enable the feature-gate stage.
    pub enabled: bool,
    /// Registered flags.
    pub flags: Vec<FlagRule>,
    /// Gated paths, first match wins.
    pub gates: Vec<GateRule>,
    /// Paths the stage ignores. A trailing `*` matches by prefix.
    pub skip_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_section_uses_defaults() {
        let config: RateLimitConfig = toml::from_str("requests_per_second = 5").unwrap();
        assert_eq!(config.requests_per_second, 5);
        assert_eq!(config.window(), Duration::from_secs(1));
        assert_eq!(config.key, RateLimitKey::ClientIp);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<CircuitBreakerConfig, _> = toml::from_str("failure_treshold = 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_enum_spelling() {
        let config: SamplingConfig = toml::from_str(r#"strategy = "rate_limiting""#).unwrap();
        assert_eq!(config.strategy, SamplingStrategy::RateLimiting);

        let jwt: JwtSection = toml::from_str(r#"algorithm = "RS256""#).unwrap();
        assert_eq!(jwt.algorithm, JwtAlgorithm::Rs256);
    }

    #[test]
    fn test_permission_parts() {
        let rule = RouteRule {
            path: "/users".to_string(),
            permission: Some("user:read".to_string()),
            ..RouteRule::default()
        };
        assert_eq!(rule.permission_parts(), Some(("user", "read")));
    }

    #[test]
    fn test_stage_sections_accept_skip_paths() {
        let breaker: CircuitBreakerConfig = toml::from_str(r#"skip_paths = ["/health"]"#).unwrap();
        assert_eq!(breaker.skip_paths, vec!["/health"]);

        let cors: CorsConfig = toml::from_str(r#"skip_paths = ["/internal/*"]"#).unwrap();
        assert_eq!(cors.skip_paths, vec!["/internal/*"]);

        for section in [
            toml::from_str::<RecoveryConfig>(r#"skip_paths = ["/metrics"]"#).map(|c| c.skip_paths),
            toml::from_str::<SamplingConfig>(r#"skip_paths = ["/metrics"]"#).map(|c| c.skip_paths),
            toml::from_str::<TracingConfig>(r#"skip_paths = ["/metrics"]"#).map(|c| c.skip_paths),
            toml::from_str::<AuthorizationConfig>(r#"skip_paths = ["/metrics"]"#).map(|c| c.skip_paths),
            toml::from_str::<TimeoutConfig>(r#"skip_paths = ["/metrics"]"#).map(|c| c.skip_paths),
            toml::from_str::<FeaturesConfig>(r#"skip_paths = ["/metrics"]"#).map(|c| c.skip_paths),
        ] {
            assert_eq!(section.unwrap(), vec!["/metrics"]);
        }
        assert!(TracingConfig::default().skip_paths.is_empty());
    }

    #[test]
    fn test_features_section() {
        let config: FeaturesConfig = toml::from_str(
            r#"
            enabled = true

            [[flags]]
            name = "export"
            enabled = false

            [[gates]]
            path = "/api/export*"
            flag = "export"
            "#,
        )
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.flags[0].name, "export");
        assert!(!config.flags[0].enabled);
        assert_eq!(config.gates[0].path, "/api/export*");
    }

    #[test]
    fn test_duration_accessors() {
        let breaker = CircuitBreakerConfig::default();
        assert_eq!(breaker.timeout(), Duration::from_secs(60));
        assert_eq!(TimeoutConfig::default().timeout(), Some(Duration::from_secs(30)));
    }
}
