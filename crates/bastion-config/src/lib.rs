//! # Bastion Config
//!
//! Typed configuration for the Bastion governance stack.
//!
//! A [`BastionConfig`] has one section per pipeline stage plus service
//! identity, logging and metrics. [`ConfigLoader`] builds one from defaults
//! or a preset, an optional TOML/JSON file, an optional `.env` file and
//! `BASTION__SECTION__KEY` environment variables, then validates it.
//!
//! ## Example
//!
//! ```
//! use bastion_config::{ConfigLoader, RateLimitKey};
//!
//! let toml = r#"
//!     [rate_limit]
//!     requests_per_second = 50
//!     key = "global"
//!
//!     [[authorization.routes]]
//!     path = "/admin/*"
//!     any_roles = ["admin"]
//! "#;
//!
//! let config = ConfigLoader::new()
//!     .with_string(toml, "toml")
//!     .unwrap()
//!     .load()
//!     .unwrap();
//!
//! assert_eq!(config.rate_limit.key, RateLimitKey::Global);
//! assert_eq!(config.authorization.routes.len(), 1);
//! ```

#![doc(html_root_url = "https://docs.rs/bastion-config/0.1.0")]
#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::BastionConfig;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    AuthorizationConfig, CircuitBreakerConfig, CorsConfig, FeaturesConfig, FlagRule, GateRule,
    JwtSection, LogFormat, LoggingConfig, MetricsConfig, RateLimitConfig, RateLimitKey,
    RecoveryConfig, RouteRule, SamplingConfig, SamplingStrategy, ServiceConfig, TimeoutConfig,
    TracingConfig,
};
