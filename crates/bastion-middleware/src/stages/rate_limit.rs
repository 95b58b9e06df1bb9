//! Token-bucket rate limiting.
//!
//! Each request is keyed (client address by default) and charged one token
//! from that key's bucket in a shared [`BucketRegistry`]. A request with no
//! token left is rejected with `429 RATE_LIMIT_EXCEEDED` and a
//! `Retry-After` header; admitted responses carry the remaining budget.
//!
//! ## Example
//!
//! ```ignore
//! use bastion_control::{BucketConfig, BucketRegistry};
//! use bastion_middleware::stages::RateLimitMiddleware;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let registry = Arc::new(BucketRegistry::new(BucketConfig::from_rate(
//!     100,
//!     Some(20),
//!     Duration::from_secs(1),
//! )));
//! let rate_limit = RateLimitMiddleware::new(registry).per_header("x-api-key");
//! ```

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_control::BucketRegistry;
use bastion_core::{client_ip, ApiError};
use http::header::HeaderName;
use std::fmt;
use std::sync::Arc;

/// Rate limit header names.
pub mod headers {
    use http::header::HeaderName;

    /// Bucket capacity.
    pub const LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
    /// Whole tokens left after this request.
    pub const REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
}

/// Key used when no better key can be derived from the request.
pub const FALLBACK_KEY: &str = "unknown";

/// Derives a caller key from a request and its context.
pub type KeyFn = Arc<dyn Fn(&Request, &MiddlewareContext) -> Option<String> + Send + Sync>;

/// How to extract the rate-limit key from a request.
#[derive(Clone, Default)]
pub enum KeyExtractor {
    /// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`,
    /// then the connection's remote address.
    #[default]
    ClientIp,
    /// A request header value.
    Header(HeaderName),
    /// The authenticated user id, falling back to the client address.
    UserId,
    /// One shared bucket for every request.
    Global,
    /// A custom function.
    Custom(KeyFn),
}

impl fmt::Debug for KeyExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientIp => f.write_str("KeyExtractor::ClientIp"),
            Self::Header(h) => f.debug_tuple("KeyExtractor::Header").field(h).finish(),
            Self::UserId => f.write_str("KeyExtractor::UserId"),
            Self::Global => f.write_str("KeyExtractor::Global"),
            Self::Custom(_) => f.write_str("KeyExtractor::Custom(<fn>)"),
        }
    }
}

impl KeyExtractor {
    /// Extracts the key for a request.
    pub fn extract(&self, request: &Request, ctx: &MiddlewareContext) -> String {
        let key = match self {
            Self::ClientIp => client_ip(request),
            Self::Header(name) => request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            Self::UserId => ctx
                .user_id()
                .map(|id| format!("user:{id}"))
                .or_else(|| client_ip(request)),
            Self::Global => Some("global".to_string()),
            Self::Custom(f) => f(request, ctx),
        };
        key.unwrap_or_else(|| FALLBACK_KEY.to_string())
    }
}

/// Rejects requests whose bucket is empty.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    registry: Arc<BucketRegistry>,
    key_extractor: KeyExtractor,
}

impl RateLimitMiddleware {
    /// Creates the stage over a shared registry, keyed by client address.
    #[must_use]
    pub fn new(registry: Arc<BucketRegistry>) -> Self {
        Self {
            registry,
            key_extractor: KeyExtractor::default(),
        }
    }

    /// Sets the key extractor.
    #[must_use]
    pub fn key_extractor(mut self, key_extractor: KeyExtractor) -> Self {
        self.key_extractor = key_extractor;
        self
    }

    /// Keys requests by a header value.
    #[must_use]
    pub fn per_header(self, header: HeaderName) -> Self {
        self.key_extractor(KeyExtractor::Header(header))
    }

    /// Keys requests by authenticated user.
    #[must_use]
    pub fn per_user(self) -> Self {
        self.key_extractor(KeyExtractor::UserId)
    }

    /// Uses one bucket for all requests.
    #[must_use]
    pub fn global(self) -> Self {
        self.key_extractor(KeyExtractor::Global)
    }

    /// Keys requests with a custom function.
    #[must_use]
    pub fn custom_key<F>(self, f: F) -> Self
    where
        F: Fn(&Request, &MiddlewareContext) -> Option<String> + Send + Sync + 'static,
    {
        self.key_extractor(KeyExtractor::Custom(Arc::new(f)))
    }

    /// Returns the shared registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let key = self.key_extractor.extract(&request, ctx);
            let admission = self.registry.allow(&key);
            let limit = self.registry.config().capacity as u64;

            if !admission.allowed {
                tracing::warn!(
                    request_id = %ctx.request_id(),
                    method = %request.method(),
                    path = %request.uri().path(),
                    key = %key,
                    retry_after_ms = admission.retry_after.as_millis() as u64,
                    "rate limit exceeded"
                );
                metrics::counter!("bastion_rate_limited_total").increment(1);

                let error = ApiError::rate_limited("Rate limit exceeded", Some(admission.retry_after));
                let mut response = Response::from_error(error, ctx);
                response.set_header(headers::LIMIT, limit);
                response.set_header(headers::REMAINING, 0);
                return response;
            }

            let mut response = next.run(ctx, request).await;
            response.set_header(headers::LIMIT, limit);
            response.set_header(headers::REMAINING, admission.remaining);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_control::BucketConfig;
    use bastion_core::{empty_response, RemoteAddr};
    use bytes::Bytes;
    use http::{Request as HttpRequest, StatusCode};
    use http_body_util::{BodyExt, Full};
    use std::time::Duration;

    fn registry(rps: u32, burst: u32) -> Arc<BucketRegistry> {
        Arc::new(BucketRegistry::new(BucketConfig::from_rate(
            rps,
            Some(burst),
            Duration::from_secs(1),
        )))
    }

    fn request_from(ip: &str) -> Request {
        HttpRequest::builder()
            .uri("/api")
            .header("x-forwarded-for", ip)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn ok<'a>() -> Next<'a> {
        Next::handler(|_ctx, _req| Box::pin(async { empty_response(StatusCode::OK) }))
    }

    #[tokio::test]
    async fn test_rejects_after_burst() {
        let middleware = RateLimitMiddleware::new(registry(1, 2));

        for remaining in ["1", "0"] {
            let mut ctx = MiddlewareContext::new();
            let response = middleware.process(&mut ctx, request_from("10.0.0.1"), ok()).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers().get(headers::LIMIT).unwrap(), "2");
            assert_eq!(response.headers().get(headers::REMAINING).unwrap(), remaining);
        }

        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request_from("10.0.0.1"), ok()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(http::header::RETRY_AFTER).unwrap(), "1");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "RATE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let middleware = RateLimitMiddleware::new(registry(1, 1));

        let mut ctx = MiddlewareContext::new();
        let a = middleware.process(&mut ctx, request_from("10.0.0.1"), ok()).await;
        let mut ctx = MiddlewareContext::new();
        let b = middleware.process(&mut ctx, request_from("10.0.0.2"), ok()).await;

        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(b.status(), StatusCode::OK);
        assert_eq!(middleware.registry().len(), 2);
    }

    #[test]
    fn test_key_extraction() {
        let ctx = MiddlewareContext::new();
        let mut request = HttpRequest::builder()
            .uri("/")
            .header("x-api-key", "k-1")
            .body(Full::new(Bytes::new()))
            .unwrap();

        assert_eq!(KeyExtractor::ClientIp.extract(&request, &ctx), FALLBACK_KEY);
        request
            .extensions_mut()
            .insert(RemoteAddr("192.0.2.7:4000".parse().unwrap()));
        assert_eq!(KeyExtractor::ClientIp.extract(&request, &ctx), "192.0.2.7");
        assert_eq!(
            KeyExtractor::Header(HeaderName::from_static("x-api-key")).extract(&request, &ctx),
            "k-1"
        );
        assert_eq!(KeyExtractor::UserId.extract(&request, &ctx), "192.0.2.7");
        assert_eq!(KeyExtractor::Global.extract(&request, &ctx), "global");

        let custom = KeyExtractor::Custom(Arc::new(|req: &Request, _ctx: &MiddlewareContext| {
            Some(req.uri().path().to_string())
        }));
        assert_eq!(custom.extract(&request, &ctx), "/");
    }
}
