//! Root configuration type.

use crate::schema::{
    AuthorizationConfig, CircuitBreakerConfig, CorsConfig, FeaturesConfig, JwtSection, LogFormat,
    LoggingConfig, MetricsConfig, RateLimitConfig, RateLimitKey, RecoveryConfig, SamplingConfig,
    SamplingStrategy, ServiceConfig, TimeoutConfig, TracingConfig,
};
use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// Complete configuration for a governance stack.
///
/// Missing sections take their defaults; unknown keys anywhere are
/// rejected at parse time.
///
/// # Example
///
/// ```
/// use bastion_config::BastionConfig;
///
/// let config: BastionConfig = toml::from_str(r#"
///     [rate_limit]
///     requests_per_second = 2
///     burst = 2
/// "#).unwrap();
///
/// assert_eq!(config.rate_limit.burst, Some(2));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BastionConfig {
    /// Service identity.
    pub service: ServiceConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Metrics recorder.
    pub metrics: MetricsConfig,
    /// Panic recovery.
    pub recovery: RecoveryConfig,
    /// Trace sampling.
    pub sampling: SamplingConfig,
    /// Tracing stage.
    pub tracing: TracingConfig,
    /// Cross-origin policy.
    pub cors: CorsConfig,
    /// Feature flags and gated paths.
    pub features: FeaturesConfig,
    /// Token-bucket rate limiting.
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Bearer-token authentication.
    pub jwt: JwtSection,
    /// Role-based authorization.
    pub authorization: AuthorizationConfig,
    /// Handler deadline.
    pub timeout: TimeoutConfig,
}

impl BastionConfig {
    /// Create a development preset.
    ///
    /// Pretty debug logs, every request sampled with the decision header,
    /// permissive CORS and a generous rate limit.
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();

        config.service.environment = "development".to_string();

        config.logging.level = "debug".to_string();
        config.logging.format = LogFormat::Pretty;
        config.logging.span_events = true;

        config.sampling.strategy = SamplingStrategy::Always;
        config.sampling.emit_header = true;

        config.cors.enabled = true;
        config.cors.allowed_origins = vec!["*".to_string()];

        config.rate_limit.requests_per_second = 1000;

        config
    }

    /// Create a production preset.
    ///
    /// JSON logs at `info` and 10% probabilistic sampling. Authentication is
    /// enabled, so key material must still be supplied.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();

        config.service.environment = "production".to_string();

        config.logging.level = "info".to_string();
        config.logging.format = LogFormat::Json;

        config.sampling.strategy = SamplingStrategy::Probabilistic;
        config.sampling.rate = 0.1;

        config.jwt.enabled = true;

        config
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid_value("logging.level", "must not be empty"));
        }

        if let Some(addr) = &self.metrics.listen_addr {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::invalid_value(
                    "metrics.listen_addr",
                    format!("invalid socket address: {addr}"),
                ));
            }
        }

        self.validate_sampling()?;
        self.validate_cors()?;
        self.validate_features()?;
        self.validate_rate_limit()?;
        self.validate_circuit_breaker()?;
        self.validate_jwt()?;
        self.validate_authorization()?;

        if self.timeout.enabled && self.timeout.timeout_ms == Some(0) {
            return Err(ConfigError::invalid_value("timeout.timeout_ms", "must be positive"));
        }

        Ok(())
    }

    fn validate_sampling(&self) -> Result<(), ConfigError> {
        let sampling = &self.sampling;
        for (field, value) in [
            ("sampling.rate", sampling.rate),
            ("sampling.min_rate", sampling.min_rate),
            ("sampling.max_rate", sampling.max_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid_value(field, "must be between 0.0 and 1.0"));
            }
        }
        if sampling.min_rate > sampling.max_rate {
            return Err(ConfigError::invalid_value(
                "sampling.min_rate",
                "must not exceed sampling.max_rate",
            ));
        }
        if sampling.strategy == SamplingStrategy::RateLimiting && sampling.max_per_second == 0 {
            return Err(ConfigError::invalid_value(
                "sampling.max_per_second",
                "must be positive",
            ));
        }
        Ok(())
    }

    fn validate_cors(&self) -> Result<(), ConfigError> {
        let cors = &self.cors;
        if !cors.enabled {
            return Ok(());
        }
        if cors.allowed_origins.is_empty() {
            return Err(ConfigError::invalid_value(
                "cors.allowed_origins",
                "at least one origin is required",
            ));
        }
        if cors.allow_credentials && cors.allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::invalid_value(
                "cors.allow_credentials",
                "credentials cannot be combined with a wildcard origin",
            ));
        }
        for method in &cors.allowed_methods {
            if method.parse::<http::Method>().is_err() {
                return Err(ConfigError::invalid_value(
                    "cors.allowed_methods",
                    format!("invalid method: {method}"),
                ));
            }
        }
        Ok(())
    }

    fn validate_rate_limit(&self) -> Result<(), ConfigError> {
        let limit = &self.rate_limit;
        if !limit.enabled {
            return Ok(());
        }
        if limit.requests_per_second == 0 {
            return Err(ConfigError::invalid_value(
                "rate_limit.requests_per_second",
                "must be positive",
            ));
        }
        if limit.burst == Some(0) {
            return Err(ConfigError::invalid_value("rate_limit.burst", "must be positive"));
        }
        if limit.window_ms == 0 {
            return Err(ConfigError::invalid_value("rate_limit.window_ms", "must be positive"));
        }
        if limit.idle_eviction_ms == Some(0) {
            return Err(ConfigError::invalid_value(
                "rate_limit.idle_eviction_ms",
                "must be positive",
            ));
        }
        if limit.key == RateLimitKey::Header {
            let valid = limit
                .key_header
                .as_deref()
                .is_some_and(|h| h.parse::<http::HeaderName>().is_ok());
            if !valid {
                return Err(ConfigError::invalid_value(
                    "rate_limit.key_header",
                    "a valid header name is required when key = \"header\"",
                ));
            }
        }
        Ok(())
    }

    fn validate_circuit_breaker(&self) -> Result<(), ConfigError> {
        let breaker = &self.circuit_breaker;
        if !breaker.enabled {
            return Ok(());
        }
        if breaker.name.is_empty() {
            return Err(ConfigError::invalid_value("circuit_breaker.name", "must not be empty"));
        }
        if breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if breaker.success_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if breaker.timeout_ms == 0 || breaker.timeout_window_ms == 0 {
            return Err(ConfigError::invalid_value(
                "circuit_breaker.timeout_ms",
                "durations must be positive",
            ));
        }
        Ok(())
    }

    fn validate_jwt(&self) -> Result<(), ConfigError> {
        let jwt = &self.jwt;
        if !jwt.enabled {
            return Ok(());
        }
        if jwt.algorithm.is_hmac() {
            if jwt.secret.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::invalid_value(
                    "jwt.secret",
                    format!("required for {}", jwt.algorithm),
                ));
            }
            if jwt.public_key_path.is_some() || jwt.private_key_path.is_some() {
                return Err(ConfigError::invalid_value(
                    "jwt.public_key_path",
                    format!("key files are not used with {}", jwt.algorithm),
                ));
            }
        } else {
            if jwt.public_key_path.is_none() {
                return Err(ConfigError::invalid_value(
                    "jwt.public_key_path",
                    format!("required for {}", jwt.algorithm),
                ));
            }
            if jwt.secret.is_some() {
                return Err(ConfigError::invalid_value(
                    "jwt.secret",
                    format!("a shared secret is not used with {}", jwt.algorithm),
                ));
            }
        }
        if jwt.access_ttl_secs == 0 {
            return Err(ConfigError::invalid_value("jwt.access_ttl_secs", "must be positive"));
        }
        Ok(())
    }

    fn validate_features(&self) -> Result<(), ConfigError> {
        let features = &self.features;
        if !features.enabled {
            return Ok(());
        }
        let mut names = std::collections::HashSet::new();
        for (index, flag) in features.flags.iter().enumerate() {
            if flag.name.is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("features.flags[{index}]"),
                    "name must not be empty",
                ));
            }
            if !names.insert(flag.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    format!("features.flags[{index}]"),
                    format!("duplicate flag: {}", flag.name),
                ));
            }
        }
        for (index, gate) in features.gates.iter().enumerate() {
            let field = format!("features.gates[{index}]");
            if gate.path.is_empty() {
                return Err(ConfigError::invalid_value(field, "path must not be empty"));
            }
            if !names.contains(gate.flag.as_str()) {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("unknown flag: {}", gate.flag),
                ));
            }
        }
        Ok(())
    }

    fn validate_authorization(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.authorization.routes.iter().enumerate() {
            let field = format!("authorization.routes[{index}]");
            if rule.path.is_empty() {
                return Err(ConfigError::invalid_value(field, "path must not be empty"));
            }
            if let Some(method) = &rule.method {
                if method.parse::<http::Method>().is_err() {
                    return Err(ConfigError::invalid_value(
                        field,
                        format!("invalid method: {method}"),
                    ));
                }
            }
            let requirements = usize::from(rule.permission.is_some())
                + usize::from(!rule.any_roles.is_empty())
                + usize::from(!rule.all_roles.is_empty());
            if requirements != 1 {
                return Err(ConfigError::invalid_value(
                    field,
                    "exactly one of permission, any_roles or all_roles is required",
                ));
            }
            if rule.permission.is_some() && rule.permission_parts().is_none() {
                return Err(ConfigError::invalid_value(
                    field,
                    "permission must be written as \"resource:action\"",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FlagRule, GateRule, RouteRule};
    use bastion_auth::JwtAlgorithm;
    use std::path::PathBuf;

    #[test]
    fn test_default_is_valid() {
        assert!(BastionConfig::default().validate().is_ok());
        assert!(BastionConfig::development().validate().is_ok());
    }

    #[test]
    fn test_production_requires_key_material() {
        let mut config = BastionConfig::production();
        assert!(config.validate().is_err());

        config.jwt.secret = Some("s3cret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sampling_bounds() {
        let mut config = BastionConfig::default();
        config.sampling.rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = BastionConfig::default();
        config.sampling.min_rate = 0.8;
        config.sampling.max_rate = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_limit_requires_positive_rate() {
        let mut config = BastionConfig::default();
        config.rate_limit.requests_per_second = 0;
        assert!(config.validate().is_err());

        config.rate_limit.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_header_key_requires_header_name() {
        let mut config = BastionConfig::default();
        config.rate_limit.key = RateLimitKey::Header;
        assert!(config.validate().is_err());

        config.rate_limit.key_header = Some("x-api-key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_breaker_thresholds() {
        let mut config = BastionConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cors_credentials_with_wildcard_rejected() {
        let mut config = BastionConfig::development();
        config.cors.allow_credentials = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cors.allow_credentials"));
    }

    #[test]
    fn test_rsa_requires_public_key() {
        let mut config = BastionConfig::default();
        config.jwt.enabled = true;
        config.jwt.algorithm = JwtAlgorithm::Rs256;
        config.jwt.secret = Some("not-for-rsa".to_string());
        assert!(config.validate().is_err());

        config.jwt.secret = None;
        config.jwt.public_key_path = Some(PathBuf::from("keys/public.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_route_rule_needs_exactly_one_requirement() {
        let mut config = BastionConfig::default();
        config.authorization.routes.push(RouteRule {
            path: "/admin/*".to_string(),
            any_roles: vec!["admin".to_string()],
            all_roles: vec!["auditor".to_string()],
            ..RouteRule::default()
        });
        assert!(config.validate().is_err());

        config.authorization.routes[0].all_roles.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gate_must_name_registered_flag() {
        let mut config = BastionConfig::default();
        config.features.enabled = true;
        config.features.flags.push(FlagRule {
            name: "export".to_string(),
            ..FlagRule::default()
        });
        config.features.gates.push(GateRule {
            path: "/api/export*".to_string(),
            flag: "export".to_string(),
        });
        assert!(config.validate().is_ok());

        config.features.gates[0].flag = "exports".to_string();
        assert!(config.validate().is_err());

        config.features.gates[0].flag = "export".to_string();
        config.features.flags.push(config.features.flags[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_skip_paths_parse() {
        let config: BastionConfig = toml::from_str(
            r#"
            [circuit_breaker]
            skip_paths = ["/health"]

            [cors]
            skip_paths = ["/internal/*"]
            "#,
        )
        .unwrap();
        assert_eq!(config.circuit_breaker.skip_paths, vec!["/health"]);
        assert_eq!(config.cors.skip_paths, vec!["/internal/*"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_route_permission_format() {
        let mut config = BastionConfig::default();
        config.authorization.routes.push(RouteRule {
            path: "/users".to_string(),
            method: Some("GET".to_string()),
            permission: Some("user-read".to_string()),
            ..RouteRule::default()
        });
        assert!(config.validate().is_err());
    }
}
