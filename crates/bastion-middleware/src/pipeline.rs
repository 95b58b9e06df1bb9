//! The middleware pipeline.
//!
//! Stages run in registration order. Composition is right-associative:
//! the first registered stage wraps all the others and the handler.
//!
//! ## Canonical Order
//!
//! ```text
//! Recovery → Sampling → Tracing → CORS → RateLimit → CircuitBreaker
//!          → Authenticate → Authorize → Timeout → Handler
//! ```
//!
//! [`Stage`] names this order. Recovery must be first so it contains panics
//! from every later stage; Sampling runs before Tracing so the span can
//! honour the decision.

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::skip::SkipPaths;
use crate::types::{Request, Response};
use bastion_core::REQUEST_ID_HEADER;
use http::HeaderValue;
use std::sync::Arc;

/// A type-erased middleware that can be stored in a vector.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// An ordered chain of stages.
///
/// # Example
///
/// ```ignore
/// use bastion_middleware::{Pipeline, SkipPaths};
/// use bastion_middleware::stages::{RecoveryMiddleware, AuthenticateMiddleware};
///
/// let pipeline = Pipeline::builder()
///     .add_stage(RecoveryMiddleware::new())
///     .add_stage_skipping(AuthenticateMiddleware::new(verifier), SkipPaths::new(["/health"]))
///     .build();
///
/// let response = pipeline.handle(request, |ctx, req| {
///     let ctx = ctx.to_request_context();
///     Box::pin(async move { handle(ctx, req).await })
/// }).await;
/// ```
pub struct Pipeline {
    stages: Vec<BoxedMiddleware>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Pipeline {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Runs a request through every stage and the handler.
    pub async fn process<H>(
        &self,
        mut ctx: MiddlewareContext,
        request: Request,
        handler: H,
    ) -> Response
    where
        H: FnOnce(&mut MiddlewareContext, Request) -> BoxFuture<'static, Response> + Send + 'static,
    {
        let next = self.build_chain(handler);
        next.run(&mut ctx, request).await
    }

    /// Pipeline entry point.
    ///
    /// Creates the request context (honouring `X-Request-ID`), runs the
    /// chain, and echoes the request id on the response.
    pub async fn handle<H>(&self, request: Request, handler: H) -> Response
    where
        H: FnOnce(&mut MiddlewareContext, Request) -> BoxFuture<'static, Response> + Send + 'static,
    {
        let ctx = MiddlewareContext::for_request(&request);
        self.handle_with(ctx, request, handler).await
    }

    /// Like [`Pipeline::handle`], with a caller-built context.
    pub async fn handle_with<H>(
        &self,
        mut ctx: MiddlewareContext,
        request: Request,
        handler: H,
    ) -> Response
    where
        H: FnOnce(&mut MiddlewareContext, Request) -> BoxFuture<'static, Response> + Send + 'static,
    {
        let next = self.build_chain(handler);
        let mut response = next.run(&mut ctx, request).await;
        if let Ok(value) = HeaderValue::from_str(ctx.request_id().as_str()) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    }

    fn build_chain<'a, H>(&'a self, handler: H) -> Next<'a>
    where
        H: FnOnce(&mut MiddlewareContext, Request) -> BoxFuture<'static, Response> + Send + 'a,
    {
        let mut next = Next::handler(handler);
        for middleware in self.stages.iter().rev() {
            next = Next::new(middleware.as_ref(), next);
        }
        next
    }

    /// Returns the names of all stages in order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|m| m.name()).collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

/// Builder for constructing a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<BoxedMiddleware>,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn add_stage<M: Middleware>(mut self, middleware: M) -> Self {
        self.stages.push(Arc::new(middleware));
        self
    }

    /// Appends a stage that is bypassed for the given paths.
    #[must_use]
    pub fn add_stage_skipping<M: Middleware>(self, middleware: M, skip: SkipPaths) -> Self {
        if skip.is_empty() {
            return self.add_stage(middleware);
        }
        self.add_stage(Skipping {
            inner: middleware,
            skip,
        })
    }

    /// Appends a shared stage.
    #[must_use]
    pub fn add_shared_stage(mut self, middleware: BoxedMiddleware) -> Self {
        self.stages.push(middleware);
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
        }
    }
}

/// Wraps a stage so that matching paths go straight to `next`.
struct Skipping<M> {
    inner: M,
    skip: SkipPaths,
}

impl<M: Middleware> Middleware for Skipping<M> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        if self.skip.matches(request.uri().path()) {
            tracing::trace!(stage = self.inner.name(), path = %request.uri().path(), "stage skipped");
            return Box::pin(next.run(ctx, request));
        }
        self.inner.process(ctx, request, next)
    }
}

/// The canonical stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Panic containment.
    Recovery = 1,
    /// Telemetry sampling decision.
    Sampling = 2,
    /// Span lifecycle and trace headers.
    Tracing = 3,
    /// Cross-origin checks and preflight.
    Cors = 4,
    /// Token-bucket admission.
    RateLimit = 5,
    /// Dependency fault isolation.
    CircuitBreaker = 6,
    /// Bearer-token verification.
    Authenticate = 7,
    /// RBAC evaluation.
    Authorize = 8,
    /// Deadline and cancellation.
    Timeout = 9,
}

impl Stage {
    /// Returns the stage name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Recovery => "recovery",
            Self::Sampling => "sampling",
            Self::Tracing => "tracing",
            Self::Cors => "cors",
            Self::RateLimit => "rate_limit",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Authenticate => "authenticate",
            Self::Authorize => "authorize",
            Self::Timeout => "timeout",
        }
    }

    /// Returns all stages in order.
    #[must_use]
    pub const fn all() -> [Stage; 9] {
        [
            Self::Recovery,
            Self::Sampling,
            Self::Tracing,
            Self::Cors,
            Self::RateLimit,
            Self::CircuitBreaker,
            Self::Authenticate,
            Self::Authorize,
            Self::Timeout,
        ]
    }
}
