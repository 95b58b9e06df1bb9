//! Sampling decision stage.
//!
//! Draws one decision per request from a shared [`Sampler`] and publishes
//! it as `sampling.decision`. The Tracing stage and the handler read it to
//! decide whether to record expensive telemetry attributes.

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_control::Sampler;
use http::header::HeaderName;
use std::sync::Arc;

/// Response header carrying the decision, when enabled.
pub const SAMPLING_DECISION_HEADER: HeaderName = HeaderName::from_static("x-sampling-decision");

/// Publishes a sampling decision on the context.
#[derive(Debug, Clone)]
pub struct SamplingMiddleware {
    sampler: Arc<Sampler>,
    emit_header: bool,
}

impl SamplingMiddleware {
    /// Creates the stage around a shared sampler.
    #[must_use]
    pub fn new(sampler: Arc<Sampler>) -> Self {
        Self {
            sampler,
            emit_header: false,
        }
    }

    /// Emits `X-Sampling-Decision: sampled | not-sampled` on responses.
    #[must_use]
    pub fn emit_header(mut self, emit: bool) -> Self {
        self.emit_header = emit;
        self
    }

    /// Returns the shared sampler.
    #[must_use]
    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }
}

impl Middleware for SamplingMiddleware {
    fn name(&self) -> &'static str {
        "sampling"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let sampled = self.sampler.should_sample();
            if let Err(err) = ctx.set_sampling_decision(sampled) {
                tracing::warn!(error = %err, "sampling decision already made");
            }
            let decision = if sampled { "sampled" } else { "not-sampled" };
            metrics::counter!("bastion_sampling_decisions_total", "decision" => decision).increment(1);

            let mut response = next.run(ctx, request).await;
            if self.emit_header {
                response.set_header(SAMPLING_DECISION_HEADER, decision);
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Request as HttpRequest, Response as HttpResponse, StatusCode};
    use http_body_util::Full;

    fn request() -> Request {
        HttpRequest::builder()
            .uri("/")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn handler<'a>() -> Next<'a> {
        Next::handler(|_ctx, _req| {
            Box::pin(async {
                HttpResponse::builder()
                    .status(StatusCode::OK)
                    .body(Full::new(Bytes::new()))
                    .unwrap()
            })
        })
    }

    #[tokio::test]
    async fn test_publishes_decision() {
        let middleware = SamplingMiddleware::new(Arc::new(Sampler::Always));
        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request(), handler()).await;

        assert_eq!(ctx.sampling_decision(), Some(true));
        assert!(response.headers().get(SAMPLING_DECISION_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_emits_header_when_enabled() {
        let middleware = SamplingMiddleware::new(Arc::new(Sampler::Never)).emit_header(true);
        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request(), handler()).await;

        assert_eq!(ctx.sampling_decision(), Some(false));
        assert_eq!(
            response.headers().get(SAMPLING_DECISION_HEADER).unwrap(),
            "not-sampled"
        );
    }

    #[tokio::test]
    async fn test_rate_limited_sampler_is_shared() {
        let sampler = Arc::new(Sampler::rate_limiting(1).unwrap());
        let middleware = SamplingMiddleware::new(Arc::clone(&sampler));

        let mut first = MiddlewareContext::new();
        middleware.process(&mut first, request(), handler()).await;
        let mut second = MiddlewareContext::new();
        middleware.process(&mut second, request(), handler()).await;

        assert_eq!(first.sampling_decision(), Some(true));
        assert_eq!(second.sampling_decision(), Some(false));
        assert_eq!(middleware.sampler().name(), "rate_limiting");
    }
}
