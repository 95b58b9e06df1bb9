//! # Bastion Control
//!
//! Process-wide traffic-control state machines for the Bastion
//! request-governance stack.
//!
//! - [`bucket`] - Token buckets and the per-key bucket registry
//! - [`breaker`] - Three-state circuit breakers and the breaker table
//! - [`features`] - Runtime feature flags
//! - [`sampling`] - Telemetry samplers (always, never, probabilistic,
//!   rate-limiting, adaptive)
//!
//! Every type here is shared across requests. State is guarded by
//! `parking_lot` locks and every time-dependent operation has an `_at`
//! variant taking an explicit [`std::time::Instant`], which keeps the
//! arithmetic testable without sleeping.

#![doc(html_root_url = "https://docs.rs/bastion-control/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod breaker;
pub mod bucket;
pub mod features;
pub mod sampling;

pub use breaker::{
    BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitOpen, CircuitState, StateChangeCallback,
};
pub use bucket::{Admission, BucketConfig, BucketRegistry, TokenBucket};
pub use features::{Feature, FeatureFlags, FeatureNotFound};
pub use sampling::{
    AdaptiveSampler, ProbabilisticSampler, RateLimitingSampler, Sampler, SamplerError,
};
