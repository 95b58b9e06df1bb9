//! # Bastion
//!
//! **Request governance for HTTP services.**
//!
//! Bastion wraps an application handler in a fixed chain of stages:
//!
//! ```text
//! Recovery → Sampling → Tracing → CORS → RateLimit → CircuitBreaker
//!          → Authenticate → Authorize → Timeout → Handler
//! ```
//!
//! Every rejection is rendered as the same JSON error envelope carrying
//! the trace id, and every response carries `X-Request-ID`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bastion::prelude::*;
//!
//! let config = ConfigLoader::new()
//!     .with_production()
//!     .with_optional_file("bastion.toml")?
//!     .with_env_prefix("BASTION")
//!     .load()?;
//! bastion::init_telemetry(&config)?;
//!
//! let gateway = Gateway::from_config(&config, |ctx, request| async move {
//!     handle(ctx, request).await
//! })?;
//!
//! let response = gateway.handle(request).await;
//! ```
//!
//! The individual crates are re-exported for finer control:
//! [`core`], [`auth`], [`control`], [`middleware`], [`telemetry`] and [`config`].

#![doc(html_root_url = "https://docs.rs/bastion/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod error;
mod gateway;
mod observe;
mod stack;

pub use error::StackError;
pub use gateway::Gateway;
pub use stack::GovernanceStack;
pub use observe::{init_telemetry, telemetry_config};

pub use bastion_config::{BastionConfig, ConfigError, ConfigLoader};

// Re-export member crates
pub use bastion_auth as auth;
pub use bastion_config as config;
pub use bastion_control as control;
pub use bastion_core as core;
pub use bastion_middleware as middleware;
pub use bastion_telemetry as telemetry;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{BastionConfig, ConfigLoader, Gateway, GovernanceStack, StackError};

    pub use bastion_auth::{Claims, JwtVerifier, RbacStore, TokenSubject};
    pub use bastion_core::{ApiError, ErrorKind, RequestId};
    pub use bastion_middleware::{
        Middleware, MiddlewareContext, Pipeline, Request, RequestContext, Response, SkipPaths,
        Stage,
    };
}
