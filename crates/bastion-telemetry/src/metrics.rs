//! Prometheus metrics.
//!
//! The stages emit through the `metrics` facade; this module installs the
//! Prometheus recorder and describes every metric they emit.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `bastion_requests_total` | Counter | `status` |
//! | `bastion_request_duration_seconds` | Histogram | - |
//! | `bastion_rate_limited_total` | Counter | - |
//! | `bastion_circuit_transitions_total` | Counter | `breaker`, `to` |
//! | `bastion_circuit_rejections_total` | Counter | `breaker` |
//! | `bastion_feature_gated_total` | Counter | `feature` |
//! | `bastion_auth_failures_total` | Counter | `reason` |
//! | `bastion_authz_denied_total` | Counter | - |
//! | `bastion_panics_recovered_total` | Counter | - |
//! | `bastion_sampling_decisions_total` | Counter | `decision` |

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names.
pub mod names {
    /// Completed requests by status.
    pub const REQUESTS_TOTAL: &str = "bastion_requests_total";
    /// Request latency.
    pub const REQUEST_DURATION_SECONDS: &str = "bastion_request_duration_seconds";
    /// Requests rejected by the rate limiter.
    pub const RATE_LIMITED_TOTAL: &str = "bastion_rate_limited_total";
    /// Breaker state transitions.
    pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "bastion_circuit_transitions_total";
    /// Requests rejected by an open breaker.
    pub const CIRCUIT_REJECTIONS_TOTAL: &str = "bastion_circuit_rejections_total";
    /// Requests rejected because their feature is off.
    pub const FEATURE_GATED_TOTAL: &str = "bastion_feature_gated_total";
    /// Failed authentications by reason.
    pub const AUTH_FAILURES_TOTAL: &str = "bastion_auth_failures_total";
    /// Requests denied by authorization.
    pub const AUTHZ_DENIED_TOTAL: &str = "bastion_authz_denied_total";
    /// Panics contained by recovery.
    pub const PANICS_RECOVERED_TOTAL: &str = "bastion_panics_recovered_total";
    /// Sampling decisions.
    pub const SAMPLING_DECISIONS_TOTAL: &str = "bastion_sampling_decisions_total";
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address for the scrape endpoint (e.g., "0.0.0.0:9090"). Without one,
    /// metrics are only available through [`render_metrics`].
    pub listen_addr: Option<String>,

    /// Histogram buckets for request duration, in seconds.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: None,
            duration_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

/// Installs the global Prometheus recorder.
///
/// With a listen address, the scrape endpoint is served by the exporter
/// (on the current Tokio runtime, or a background thread otherwise).
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::REQUEST_DURATION_SECONDS.to_string()),
            &config.duration_buckets,
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    match &config.listen_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| TelemetryError::InvalidAddress(format!("{addr}: {e}")))?;
            builder
                .with_http_listener(addr)
                .install()
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            tracing::info!(%addr, "metrics endpoint listening");
        }
        None => {
            let handle = builder
                .install_recorder()
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            let _ = METRICS_HANDLE.set(handle);
        }
    }

    describe_metrics();
    Ok(())
}

/// Renders metrics in Prometheus text format.
///
/// Returns `None` unless the recorder was installed without a listener.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

/// Registers descriptions for every metric the stages emit.
pub fn describe_metrics() {
    describe_counter!(names::REQUESTS_TOTAL, "Completed requests by HTTP status");
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from pipeline entry to response"
    );
    describe_counter!(names::RATE_LIMITED_TOTAL, "Requests rejected by the rate limiter");
    describe_counter!(
        names::CIRCUIT_TRANSITIONS_TOTAL,
        "Circuit breaker state transitions by breaker and target state"
    );
    describe_counter!(
        names::CIRCUIT_REJECTIONS_TOTAL,
        "Requests rejected while a circuit was open"
    );
    describe_counter!(names::FEATURE_GATED_TOTAL, "Requests rejected by a disabled feature");
    describe_counter!(names::AUTH_FAILURES_TOTAL, "Failed authentications by reason");
    describe_counter!(names::AUTHZ_DENIED_TOTAL, "Requests denied by route policy");
    describe_counter!(names::PANICS_RECOVERED_TOTAL, "Panics contained by recovery");
    describe_counter!(names::SAMPLING_DECISIONS_TOTAL, "Sampling decisions by outcome");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(config.listen_addr.is_none());
        assert_eq!(config.duration_buckets.len(), 12);
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let config = MetricsConfig {
            listen_addr: Some("not-an-address".to_string()),
            ..MetricsConfig::default()
        };
        assert!(matches!(init_metrics(&config), Err(TelemetryError::InvalidAddress(_))));
    }

    #[test]
    fn test_disabled_metrics_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_describe_without_recorder() {
        describe_metrics();
    }
}
