//! Deadline and cancellation for the rest of the pipeline.
//!
//! Races the downstream stages against an optional deadline and the
//! context's [`CancellationToken`](tokio_util::sync::CancellationToken).
//! Whichever ends first wins: a late handler is dropped and the request is
//! answered with `504 TIMEOUT`. On expiry the token is cancelled so work the
//! handler spawned with a [`RequestContext`](crate::context::RequestContext)
//! can stop too.

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_core::ApiError;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupted {
    Deadline,
    Cancelled,
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Bounds request handling time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeoutMiddleware {
    timeout: Option<Duration>,
}

impl TimeoutMiddleware {
    /// Creates the stage. With `None`, only cancellation ends a request
    /// early.
    #[must_use]
    pub const fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Returns the deadline.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Middleware for TimeoutMiddleware {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let token = ctx.cancellation().clone();
            let method = request.method().clone();
            let path = request.uri().path().to_string();

            let outcome = {
                let downstream = next.run(ctx, request);
                tokio::pin!(downstream);
                tokio::select! {
                    biased;
                    response = &mut downstream => Ok(response),
                    () = token.cancelled() => Err(Interrupted::Cancelled),
                    () = deadline(self.timeout) => Err(Interrupted::Deadline),
                }
            };

            match outcome {
                Ok(response) => response,
                Err(interrupted) => {
                    if interrupted == Interrupted::Deadline {
                        token.cancel();
                    }
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        method = %method,
                        path = %path,
                        cause = ?interrupted,
                        elapsed_ms = ctx.elapsed().as_millis() as u64,
                        "request did not complete"
                    );
                    Response::from_error(ApiError::timeout("Request timed out"), ctx)
                }
            }
        })
    }
}
