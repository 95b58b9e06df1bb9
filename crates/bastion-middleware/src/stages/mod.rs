//! Pipeline stages.
//!
//! In canonical order, outermost first:
//!
//! 1. [`recovery`] - Contain panics as `500 INTERNAL_ERROR`
//! 2. [`sampling`] - Decide whether this request gets detailed telemetry
//! 3. [`tracing`] - Server span, trace/span ids and timing headers
//! 4. [`cors`] - Origin check and preflight
//! 5. [`rate_limit`] - Per-key token buckets
//! 6. [`circuit_breaker`] - Fail fast while a dependency is unhealthy
//! 7. [`authenticate`] - Bearer JWT validation
//! 8. [`authorize`] - Route policies against RBAC
//! 9. [`timeout`] - Deadline and cancellation around the handler
//!
//! [`feature_gate`] is an optional extra stage outside the canonical nine.
//! When configured it runs right after CORS.

pub mod authenticate;
pub mod authorize;
pub mod circuit_breaker;
pub mod cors;
pub mod feature_gate;
pub mod rate_limit;
pub mod recovery;
pub mod sampling;
pub mod timeout;
pub mod tracing;

pub use authenticate::AuthenticateMiddleware;
pub use authorize::{AuthorizeMiddleware, Requirement, RoutePolicy};
pub use circuit_breaker::CircuitBreakerMiddleware;
pub use cors::{AllowedOrigins, CorsBuilder, CorsError, CorsMiddleware};
pub use feature_gate::{feature_enabled, FeatureGate, FeatureGateMiddleware};
pub use rate_limit::{KeyExtractor, RateLimitMiddleware};
pub use recovery::RecoveryMiddleware;
pub use sampling::SamplingMiddleware;
pub use timeout::TimeoutMiddleware;
pub use tracing::{TraceContext, TracingMiddleware};
