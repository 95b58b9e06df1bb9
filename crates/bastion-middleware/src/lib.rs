//! # Bastion Middleware
//!
//! The request-governance pipeline: a [`Middleware`] trait, the [`Pipeline`]
//! that composes stages around a handler, the per-request
//! [`MiddlewareContext`] and the built-in [`stages`].
//!
//! ## Pipeline order
//!
//! ```text
//! Request → Recovery → Sampling → Tracing → CORS → RateLimit
//!         → CircuitBreaker → Authenticate → Authorize → Timeout → Handler
//! ```
//!
//! Stages run in registration order. Any stage may answer the request itself
//! without calling `next`; every such answer is an error envelope rendered
//! through [`ResponseExt::from_error`]. A stage can be bypassed for some
//! paths with [`PipelineBuilder::add_stage_skipping`], which skips only that
//! stage.
//!
//! ## Example
//!
//! ```
//! use bastion_middleware::pipeline::Stage;
//!
//! let stages = Stage::all();
//! assert_eq!(stages.len(), 9);
//! assert_eq!(stages[0].name(), "recovery");
//! assert_eq!(stages[8].name(), "timeout");
//! ```

#![doc(html_root_url = "https://docs.rs/bastion-middleware/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod context;
pub mod middleware;
pub mod pipeline;
pub mod skip;
pub mod stages;
pub mod types;

pub use context::{ContextError, MiddlewareContext, RequestContext};
pub use middleware::{BoxFuture, Middleware, Next};
pub use pipeline::{BoxedMiddleware, Pipeline, PipelineBuilder, Stage};
pub use skip::SkipPaths;
pub use types::{Request, Response, ResponseExt};
