//! Telemetry settings derived from configuration.

use bastion_config::{BastionConfig, LogFormat};
use bastion_telemetry::{LogConfig, MetricsConfig, TelemetryConfig};

/// Maps the `service`, `logging` and `metrics` sections onto telemetry settings.
pub fn telemetry_config(config: &BastionConfig) -> TelemetryConfig {
    let base = match config.logging.format {
        LogFormat::Json => LogConfig::production(),
        LogFormat::Pretty => LogConfig::development(),
    };
    let logging = LogConfig {
        enabled: config.logging.enabled,
        level: config.logging.level.clone(),
        span_events: config.logging.span_events,
        ..base
    };
    let metrics = MetricsConfig {
        enabled: config.metrics.enabled,
        listen_addr: config.metrics.listen_addr.clone(),
        ..MetricsConfig::default()
    };

    TelemetryConfig::builder()
        .service_name(config.service.name.clone())
        .service_version(config.service.version.clone())
        .logging(logging)
        .metrics(metrics)
        .build()
}

/// Installs logging and metrics for `config`. Call once per process.
pub fn init_telemetry(config: &BastionConfig) -> Result<(), crate::StackError> {
    bastion_telemetry::init_telemetry(&telemetry_config(config))?;
    Ok(())
}
