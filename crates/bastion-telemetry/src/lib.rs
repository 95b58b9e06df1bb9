//! Observability setup for Bastion.
//!
//! - **Logging**: structured logs through `tracing-subscriber`, JSON in
//!   production and pretty in development
//! - **Metrics**: a Prometheus recorder for the `metrics` facade, with
//!   descriptions for every metric the pipeline stages emit
//!
//! Spans are produced by the Tracing stage through the `tracing` crate and
//! appear in the log output with the trace id attached.
//!
//! # Example
//!
//! ```rust,ignore
//! use bastion_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::builder()
//!     .service_name("edge")
//!     .metrics_addr("0.0.0.0:9090")
//!     .build();
//! init_telemetry(&config)?;
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::TelemetryError;
pub use logging::{create_env_filter, init_logging, LogConfig};
pub use metrics::{describe_metrics, init_metrics, render_metrics, MetricsConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Configuration for logging and metrics together.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryConfig {
    /// Service name, logged once at startup.
    pub service_name: String,

    /// Service version.
    pub service_version: String,

    /// Logging configuration.
    pub logging: LogConfig,

    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "bastion".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            logging: LogConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl TelemetryConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::default()
    }
}

/// Builder for [`TelemetryConfig`].
#[derive(Debug, Default)]
pub struct TelemetryConfigBuilder {
    config: TelemetryConfig,
}

impl TelemetryConfigBuilder {
    /// Sets the service name.
    #[must_use]
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    /// Sets the service version.
    #[must_use]
    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.config.service_version = version.into();
        self
    }

    /// Sets the logging configuration.
    #[must_use]
    pub fn logging(mut self, logging: LogConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Sets the metrics configuration.
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsConfig) -> Self {
        self.config.metrics = metrics;
        self
    }

    /// Serves the scrape endpoint on `addr`.
    #[must_use]
    pub fn metrics_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.metrics.enabled = true;
        self.config.metrics.listen_addr = Some(addr.into());
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> TelemetryConfig {
        self.config
    }
}

/// Installs logging, then metrics.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryResult<()> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "telemetry initialized"
    );
    Ok(())
}
