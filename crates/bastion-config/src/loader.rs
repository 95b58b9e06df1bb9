//! Layered configuration loading.
//!
//! Layers, later overriding earlier:
//! 1. Built-in defaults or a preset
//! 2. A TOML or JSON file
//! 3. A `.env` file, which only feeds the process environment
//! 4. `PREFIX__SECTION__KEY` environment variables

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use crate::schema::{LogFormat, RateLimitKey, SamplingStrategy};
use crate::{BastionConfig, ConfigError};

/// Configuration loader.
///
/// # Example
///
/// ```no_run
/// use bastion_config::ConfigLoader;
///
/// # fn main() -> Result<(), bastion_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_production()
///     .with_optional_file("bastion.toml")?
///     .with_dotenv()?
///     .with_env_prefix("BASTION")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: BastionConfig,
    env_prefix: Option<String>,
    file_loaded: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a loader starting from defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: BastionConfig::default(),
            env_prefix: None,
            file_loaded: false,
        }
    }

    /// Reset to default values.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.config = BastionConfig::default();
        self
    }

    /// Start from the development preset.
    ///
    /// ```
    /// use bastion_config::{ConfigLoader, LogFormat};
    ///
    /// let config = ConfigLoader::new().with_development().load().unwrap();
    /// assert_eq!(config.logging.format, LogFormat::Pretty);
    /// ```
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = BastionConfig::development();
        self
    }

    /// Start from the production preset.
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = BastionConfig::production();
        self
    }

    /// Load a configuration file. The format follows the extension
    /// (`.toml` or `.json`).
    ///
    /// The file replaces the current configuration; sections it omits take
    /// their defaults.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        self.config = Self::parse_file(&content, path)?;
        self.file_loaded = true;

        Ok(self)
    }

    /// Load a configuration file if it exists.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration from a string in the named format.
    ///
    /// ```
    /// use bastion_config::ConfigLoader;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string("[circuit_breaker]\nfailure_threshold = 3", "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.circuit_breaker.failure_threshold, 3);
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_lowercase().as_str() {
            "toml" => toml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        Ok(self)
    }

    /// Read overrides from `PREFIX__SECTION__KEY` variables at load time.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Load `.env` from the working directory into the process environment.
    /// A missing file is ignored.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) => Ok(self),
            Err(e) if e.not_found() => Ok(self),
            Err(e) => Err(e.into()),
        }
    }

    /// Load a specific env file into the process environment.
    pub fn with_dotenv_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        dotenvy::from_path(path.as_ref())?;
        Ok(self)
    }

    /// Whether a file layer was applied.
    pub fn file_loaded(&self) -> bool {
        self.file_loaded
    }

    /// Apply environment overrides and validate.
    pub fn load(mut self) -> Result<BastionConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }

        self.config.validate()?;

        Ok(self.config)
    }

    /// Return the configuration without env overrides or validation.
    #[must_use]
    pub fn load_unvalidated(self) -> BastionConfig {
        self.config
    }

    fn parse_file(content: &str, path: &Path) -> Result<BastionConfig, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        match extension.as_deref() {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let marker = format!("{prefix}__");
        let env_vars: HashMap<String, String> =
            env::vars().filter(|(k, _)| k.starts_with(&marker)).collect();

        for (key, value) in env_vars {
            self.apply_env_var(&key, &value, prefix)?;
        }

        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let key_without_prefix = key
            .strip_prefix(prefix)
            .and_then(|k| k.strip_prefix("__"))
            .ok_or_else(|| ConfigError::env_parse_error(key, "invalid key format"))?;

        let parts: Vec<&str> = key_without_prefix.split("__").collect();
        let config = &mut self.config;

        match parts.as_slice() {
            // Service
            ["SERVICE", "NAME"] => config.service.name = value.to_string(),
            ["SERVICE", "VERSION"] => config.service.version = value.to_string(),
            ["SERVICE", "ENVIRONMENT"] => config.service.environment = value.to_string(),

            // Logging and metrics
            ["LOGGING", "ENABLED"] => config.logging.enabled = bool_var(key, value)?,
            ["LOGGING", "LEVEL"] => config.logging.level = value.to_string(),
            ["LOGGING", "FORMAT"] => {
                config.logging.format = match value.to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    _ => return Err(ConfigError::env_parse_error(key, "expected json or pretty")),
                };
            }
            ["METRICS", "ENABLED"] => config.metrics.enabled = bool_var(key, value)?,
            ["METRICS", "LISTEN_ADDR"] => config.metrics.listen_addr = optional(value),

            // Sampling
            ["SAMPLING", "STRATEGY"] => {
                config.sampling.strategy = match value.to_lowercase().as_str() {
                    "always" => SamplingStrategy::Always,
                    "never" => SamplingStrategy::Never,
                    "probabilistic" => SamplingStrategy::Probabilistic,
                    "rate_limiting" => SamplingStrategy::RateLimiting,
                    "adaptive" => SamplingStrategy::Adaptive,
                    _ => return Err(ConfigError::env_parse_error(key, "unknown strategy")),
                };
            }
            ["SAMPLING", "RATE"] => config.sampling.rate = parse_var(key, value, "expected number")?,
            ["SAMPLING", "MAX_PER_SECOND"] => {
                config.sampling.max_per_second = parse_var(key, value, "expected integer")?;
            }
            ["SAMPLING", "EMIT_HEADER"] => config.sampling.emit_header = bool_var(key, value)?,

            ["TRACING", "ENABLED"] => config.tracing.enabled = bool_var(key, value)?,

            // CORS
            ["CORS", "ENABLED"] => config.cors.enabled = bool_var(key, value)?,
            ["CORS", "ALLOWED_ORIGINS"] => config.cors.allowed_origins = list(value),
            ["CORS", "ALLOW_CREDENTIALS"] => {
                config.cors.allow_credentials = bool_var(key, value)?;
            }

            // Rate limit
            ["RATE_LIMIT", "ENABLED"] => config.rate_limit.enabled = bool_var(key, value)?,
            ["RATE_LIMIT", "REQUESTS_PER_SECOND"] => {
                config.rate_limit.requests_per_second = parse_var(key, value, "expected integer")?;
            }
            ["RATE_LIMIT", "BURST"] => {
                config.rate_limit.burst = Some(parse_var(key, value, "expected integer")?);
            }
            ["RATE_LIMIT", "KEY"] => {
                config.rate_limit.key = match value.to_lowercase().as_str() {
                    "client_ip" => RateLimitKey::ClientIp,
                    "header" => RateLimitKey::Header,
                    "user" => RateLimitKey::User,
                    "global" => RateLimitKey::Global,
                    _ => return Err(ConfigError::env_parse_error(key, "unknown key kind")),
                };
            }
            ["RATE_LIMIT", "KEY_HEADER"] => config.rate_limit.key_header = optional(value),

            // Circuit breaker
            ["CIRCUIT_BREAKER", "ENABLED"] => {
                config.circuit_breaker.enabled = bool_var(key, value)?;
            }
            ["CIRCUIT_BREAKER", "FAILURE_THRESHOLD"] => {
                config.circuit_breaker.failure_threshold =
                    parse_var(key, value, "expected integer")?;
            }
            ["CIRCUIT_BREAKER", "SUCCESS_THRESHOLD"] => {
                config.circuit_breaker.success_threshold =
                    parse_var(key, value, "expected integer")?;
            }
            ["CIRCUIT_BREAKER", "TIMEOUT_MS"] => {
                config.circuit_breaker.timeout_ms = parse_var(key, value, "expected integer")?;
            }

            // JWT
            ["JWT", "ENABLED"] => config.jwt.enabled = bool_var(key, value)?,
            ["JWT", "ISSUER"] => config.jwt.issuer = value.to_string(),
            ["JWT", "AUDIENCE"] => config.jwt.audience = value.to_string(),
            ["JWT", "ALGORITHM"] => {
                config.jwt.algorithm = value
                    .parse()
                    .map_err(|_| ConfigError::env_parse_error(key, "unsupported algorithm"))?;
            }
            ["JWT", "SECRET"] => config.jwt.secret = optional(value),
            ["JWT", "PRIVATE_KEY_PATH"] => {
                config.jwt.private_key_path = optional(value).map(Into::into);
            }
            ["JWT", "PUBLIC_KEY_PATH"] => {
                config.jwt.public_key_path = optional(value).map(Into::into);
            }
            ["JWT", "LEEWAY_SECS"] => {
                config.jwt.leeway_secs = parse_var(key, value, "expected integer")?;
            }

            ["AUTHORIZATION", "ENABLED"] => {
                config.authorization.enabled = bool_var(key, value)?;
            }

            // Timeout
            ["TIMEOUT", "ENABLED"] => config.timeout.enabled = bool_var(key, value)?,
            ["TIMEOUT", "TIMEOUT_MS"] => {
                config.timeout.timeout_ms = if value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(parse_var(key, value, "expected integer or 'none'")?)
                };
            }

            ["FEATURES", "ENABLED"] => config.features.enabled = bool_var(key, value)?,

            ["RECOVERY", "SKIP_PATHS"] => config.recovery.skip_paths = list(value),
            ["SAMPLING", "SKIP_PATHS"] => config.sampling.skip_paths = list(value),
            ["TRACING", "SKIP_PATHS"] => config.tracing.skip_paths = list(value),
            ["CORS", "SKIP_PATHS"] => config.cors.skip_paths = list(value),
            ["FEATURES", "SKIP_PATHS"] => config.features.skip_paths = list(value),
            ["RATE_LIMIT", "SKIP_PATHS"] => config.rate_limit.skip_paths = list(value),
            ["CIRCUIT_BREAKER", "SKIP_PATHS"] => config.circuit_breaker.skip_paths = list(value),
            ["JWT", "SKIP_PATHS"] => config.jwt.skip_paths = list(value),
            ["AUTHORIZATION", "SKIP_PATHS"] => config.authorization.skip_paths = list(value),
            ["TIMEOUT", "SKIP_PATHS"] => config.timeout.skip_paths = list(value),

            // Unrelated settings may share the prefix.
            _ => {}
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn bool_var(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env_parse_error(key, "expected boolean"))
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str, expected: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env_parse_error(key, expected))
}

fn optional(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(loader: &mut ConfigLoader, key: &str, value: &str) -> Result<(), ConfigError> {
        loader.apply_env_var(key, value, "BASTION")
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_list_trims_entries() {
        assert_eq!(
            list("https://a.example, https://b.example,"),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_env_overrides_scalar_fields() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "BASTION__RATE_LIMIT__REQUESTS_PER_SECOND", "7").unwrap();
        apply(&mut loader, "BASTION__RATE_LIMIT__BURST", "14").unwrap();
        apply(&mut loader, "BASTION__CIRCUIT_BREAKER__FAILURE_THRESHOLD", "3").unwrap();
        apply(&mut loader, "BASTION__SAMPLING__STRATEGY", "adaptive").unwrap();
        apply(&mut loader, "BASTION__TIMEOUT__TIMEOUT_MS", "none").unwrap();

        let config = loader.load_unvalidated();
        assert_eq!(config.rate_limit.requests_per_second, 7);
        assert_eq!(config.rate_limit.burst, Some(14));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.sampling.strategy, SamplingStrategy::Adaptive);
        assert_eq!(config.timeout.timeout_ms, None);
    }

    #[test]
    fn test_env_overrides_jwt() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "BASTION__JWT__ENABLED", "true").unwrap();
        apply(&mut loader, "BASTION__JWT__ALGORITHM", "HS384").unwrap();
        apply(&mut loader, "BASTION__JWT__SECRET", "top-secret").unwrap();

        let config = loader.load().unwrap();
        assert!(config.jwt.enabled);
        assert_eq!(config.jwt.algorithm, bastion_auth::JwtAlgorithm::Hs384);
        assert_eq!(config.jwt.secret.as_deref(), Some("top-secret"));
    }

    #[test]
    fn test_env_overrides_skip_paths() {
        let mut loader = ConfigLoader::new();
        apply(&mut loader, "BASTION__CIRCUIT_BREAKER__SKIP_PATHS", "/health, /metrics").unwrap();
        apply(&mut loader, "BASTION__TIMEOUT__SKIP_PATHS", "/stream/*").unwrap();

        let config = loader.load().unwrap();
        assert_eq!(config.circuit_breaker.skip_paths, vec!["/health", "/metrics"]);
        assert_eq!(config.timeout.skip_paths, vec!["/stream/*"]);
    }

    #[test]
    fn test_env_parse_error_names_variable() {
        let mut loader = ConfigLoader::new();
        let err = apply(&mut loader, "BASTION__RATE_LIMIT__BURST", "lots").unwrap_err();
        assert!(matches!(err, ConfigError::EnvParseError { ref var, .. } if var == "BASTION__RATE_LIMIT__BURST"));
    }

    #[test]
    fn test_unknown_variable_ignored() {
        let mut loader = ConfigLoader::new();
        assert!(apply(&mut loader, "BASTION__UPSTREAM__URL", "http://x").is_ok());
    }

    #[test]
    fn test_string_format() {
        let loader = ConfigLoader::new()
            .with_string(r#"{"service": {"name": "edge"}}"#, "json")
            .unwrap();
        assert_eq!(loader.load_unvalidated().service.name, "edge");

        let err = ConfigLoader::new().with_string("", "yaml").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }
}
