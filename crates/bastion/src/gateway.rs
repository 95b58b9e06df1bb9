//! Pipeline plus application handler.

use std::future::Future;
use std::sync::Arc;

use bastion_config::BastionConfig;
use bastion_middleware::{BoxFuture, MiddlewareContext, Request, RequestContext, Response};

use crate::{GovernanceStack, StackError};

type SharedHandler = Arc<dyn Fn(RequestContext, Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// A governance stack bound to the handler it protects.
///
/// The handler receives a [`RequestContext`] snapshot with the request id,
/// trace ids, sampling decision, verified claims and the cancellation token
/// the Timeout stage fires.
///
/// # Example
///
/// ```
/// use bastion::{BastionConfig, Gateway};
/// use bastion::core::empty_response;
/// use http::StatusCode;
///
/// # fn main() -> Result<(), bastion::StackError> {
/// let gateway = Gateway::from_config(&BastionConfig::default(), |ctx, _request| async move {
///     tracing::info!(request_id = %ctx.request_id(), "handling");
///     empty_response(StatusCode::NO_CONTENT)
/// })?;
/// assert_eq!(gateway.stack().pipeline().stage_count(), 7);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Gateway {
    stack: Arc<GovernanceStack>,
    handler: SharedHandler,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").field("stack", &self.stack).finish_non_exhaustive()
    }
}

impl Gateway {
    /// Binds `handler` to an assembled stack.
    pub fn new<F, Fut>(stack: GovernanceStack, handler: F) -> Self
    where
        F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Self {
            stack: Arc::new(stack),
            handler: Arc::new(
                move |ctx: RequestContext, request: Request| -> BoxFuture<'static, Response> {
                    Box::pin(handler(ctx, request))
                },
            ),
        }
    }

    /// Assembles the stack from `config` and binds `handler`.
    pub fn from_config<F, Fut>(config: &BastionConfig, handler: F) -> Result<Self, StackError>
    where
        F: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        Ok(Self::new(GovernanceStack::from_config(config)?, handler))
    }

    /// The stack in front of the handler.
    pub fn stack(&self) -> &GovernanceStack {
        &self.stack
    }

    /// Runs one request through every stage and, if admitted, the handler.
    ///
    /// Always produces a response: rejections and contained panics come
    /// back as error envelopes.
    pub async fn handle(&self, request: Request) -> Response {
        let handler = Arc::clone(&self.handler);
        self.stack
            .pipeline()
            .handle(request, move |ctx: &mut MiddlewareContext, request| {
                handler(ctx.to_request_context(), request)
            })
            .await
    }

    /// Like [`Gateway::handle`], with a caller-built context, for example
    /// one carrying a connection-scoped cancellation token.
    pub async fn handle_with(&self, ctx: MiddlewareContext, request: Request) -> Response {
        let handler = Arc::clone(&self.handler);
        self.stack
            .pipeline()
            .handle_with(ctx, request, move |ctx: &mut MiddlewareContext, request| {
                handler(ctx.to_request_context(), request)
            })
            .await
    }
}
