//! Stack assembly errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning a configuration into a running stack.
#[derive(Debug, Error)]
pub enum StackError {
    /// The configuration failed to load or validate.
    #[error(transparent)]
    Config(#[from] bastion_config::ConfigError),

    /// JWT key material was rejected.
    #[error("authentication setup failed: {0}")]
    Auth(#[from] bastion_auth::AuthError),

    /// A sampler parameter was out of range.
    #[error("sampler setup failed: {0}")]
    Sampler(#[from] bastion_control::SamplerError),

    /// The CORS policy was inconsistent.
    #[error("CORS setup failed: {0}")]
    Cors(#[from] bastion_middleware::stages::CorsError),

    /// A key file could not be read.
    #[error("failed to read key file {path}")]
    KeyFile {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A header or method name in the configuration is not valid HTTP.
    #[error("invalid {field}: {value}")]
    InvalidHttp {
        /// Configuration field.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// Logging or metrics could not be installed.
    #[error(transparent)]
    Telemetry(#[from] bastion_telemetry::TelemetryError),
}

impl StackError {
    pub(crate) fn invalid_http(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidHttp {
            field,
            value: value.into(),
        }
    }
}
