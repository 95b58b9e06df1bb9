//! CORS (Cross-Origin Resource Sharing).
//!
//! Requests without an `Origin` header, or from an origin that is not
//! allowed, pass through untouched. Allowed origins get
//! `Access-Control-Allow-*` headers on the response. An `OPTIONS` request
//! from an allowed origin is answered here with `204 No Content` and never
//! reaches later stages.
//!
//! A configuration that allows credentials together with the `*` origin is
//! rejected by [`CorsBuilder::build`].
//!
//! ## Example
//!
//! ```
//! use bastion_middleware::stages::CorsMiddleware;
//! use http::Method;
//! use std::time::Duration;
//!
//! let cors = CorsMiddleware::builder()
//!     .allow_origin("https://app.example.com")
//!     .allow_methods([Method::GET, Method::POST])
//!     .allow_headers(["Content-Type", "Authorization"])
//!     .allow_credentials(true)
//!     .max_age(Duration::from_secs(3600))
//!     .build()
//!     .unwrap();
//! # let _ = cors;
//! ```

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response};
use bastion_core::empty_response;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

/// CORS header names.
pub mod headers {
    /// `Access-Control-Allow-Origin` header.
    pub const ALLOW_ORIGIN: &str = "access-control-allow-origin";
    /// `Access-Control-Allow-Methods` header.
    pub const ALLOW_METHODS: &str = "access-control-allow-methods";
    /// `Access-Control-Allow-Headers` header.
    pub const ALLOW_HEADERS: &str = "access-control-allow-headers";
    /// `Access-Control-Allow-Credentials` header.
    pub const ALLOW_CREDENTIALS: &str = "access-control-allow-credentials";
    /// `Access-Control-Max-Age` header.
    pub const MAX_AGE: &str = "access-control-max-age";
    /// `Access-Control-Expose-Headers` header.
    pub const EXPOSE_HEADERS: &str = "access-control-expose-headers";
    /// `Origin` header.
    pub const ORIGIN: &str = "origin";
    /// `Vary` header.
    pub const VARY: &str = "vary";
}

/// Invalid CORS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorsError {
    /// Credentials cannot be combined with the `*` origin.
    #[error("allow_credentials cannot be combined with the wildcard origin")]
    CredentialsWithWildcard,
}

/// The set of allowed origins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    /// Any origin (`*`).
    Any,
    /// Specific origins.
    List(BTreeSet<String>),
}

impl AllowedOrigins {
    /// Checks if an origin is allowed.
    pub fn is_allowed(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::List(origins) => origins.contains(origin),
        }
    }

    /// Returns the `Access-Control-Allow-Origin` value for an allowed origin.
    pub fn header_value(&self, origin: &str) -> Option<HeaderValue> {
        match self {
            Self::Any => Some(HeaderValue::from_static("*")),
            Self::List(origins) if origins.contains(origin) => HeaderValue::from_str(origin).ok(),
            Self::List(_) => None,
        }
    }
}

/// CORS policy.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    allowed_origins: AllowedOrigins,
    allowed_methods: Vec<Method>,
    allowed_headers: BTreeSet<String>,
    expose_headers: BTreeSet<String>,
    allow_credentials: bool,
    max_age: Option<Duration>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: AllowedOrigins::List(BTreeSet::new()),
            allowed_methods: vec![
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::PATCH,
            ],
            allowed_headers: BTreeSet::from([
                "authorization".to_string(),
                "content-type".to_string(),
                "x-request-id".to_string(),
            ]),
            expose_headers: BTreeSet::new(),
            allow_credentials: false,
            max_age: Some(Duration::from_secs(86400)),
        }
    }
}

impl CorsConfig {
    /// Returns the allowed origins.
    pub fn allowed_origins(&self) -> &AllowedOrigins {
        &self.allowed_origins
    }

    /// Returns whether credentials are allowed.
    pub fn allow_credentials(&self) -> bool {
        self.allow_credentials
    }
}

/// Builder for [`CorsMiddleware`].
#[derive(Debug, Clone, Default)]
pub struct CorsBuilder {
    config: CorsConfig,
}

impl CorsBuilder {
    /// Creates a builder with the default policy (no origins allowed).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows any origin (`*`).
    #[must_use]
    pub fn allow_any_origin(mut self) -> Self {
        self.config.allowed_origins = AllowedOrigins::Any;
        self
    }

    /// Adds an allowed origin. `"*"` allows any origin.
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        let origin = origin.into();
        if origin == "*" {
            return self.allow_any_origin();
        }
        if let AllowedOrigins::List(origins) = &mut self.config.allowed_origins {
            origins.insert(origin);
        }
        self
    }

    /// Adds several allowed origins.
    #[must_use]
    pub fn allow_origins<I, S>(self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        origins.into_iter().fold(self, Self::allow_origin)
    }

    /// Sets the allowed methods.
    #[must_use]
    pub fn allow_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.config.allowed_methods.clear();
        for method in methods {
            if !self.config.allowed_methods.contains(&method) {
                self.config.allowed_methods.push(method);
            }
        }
        self
    }

    /// Sets the allowed request headers.
    #[must_use]
    pub fn allow_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_headers = headers.into_iter().map(|h| h.into().to_lowercase()).collect();
        self
    }

    /// Sets the headers exposed to scripts.
    #[must_use]
    pub fn expose_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.expose_headers = headers.into_iter().map(|h| h.into().to_lowercase()).collect();
        self
    }

    /// Sets whether credentials are allowed.
    #[must_use]
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.config.allow_credentials = allow;
        self
    }

    /// Sets the preflight cache duration.
    #[must_use]
    pub fn max_age(mut self, duration: Duration) -> Self {
        self.config.max_age = Some(duration);
        self
    }

    /// Omits `Access-Control-Max-Age`.
    #[must_use]
    pub fn no_max_age(mut self) -> Self {
        self.config.max_age = None;
        self
    }

    /// Validates the policy and builds the stage.
    pub fn build(self) -> Result<CorsMiddleware, CorsError> {
        if self.config.allow_credentials && self.config.allowed_origins == AllowedOrigins::Any {
            return Err(CorsError::CredentialsWithWildcard);
        }
        Ok(CorsMiddleware {
            config: self.config,
        })
    }
}

/// Origin checks, CORS headers and preflight short-circuit.
#[derive(Debug, Clone)]
pub struct CorsMiddleware {
    config: CorsConfig,
}

impl CorsMiddleware {
    /// Creates a new CORS builder.
    #[must_use]
    pub fn builder() -> CorsBuilder {
        CorsBuilder::new()
    }

    /// Returns the policy.
    #[must_use]
    pub fn config(&self) -> &CorsConfig {
        &self.config
    }

    fn allowed_origin(&self, request: &Request) -> Option<HeaderValue> {
        let origin = request.headers().get(headers::ORIGIN)?.to_str().ok()?;
        self.config.allowed_origins.header_value(origin)
    }

    fn insert_common(&self, map: &mut HeaderMap, origin: HeaderValue) {
        map.insert(headers::ALLOW_ORIGIN, origin);
        if self.config.allow_credentials {
            map.insert(headers::ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        map.append(headers::VARY, HeaderValue::from_static("Origin"));
    }

    fn preflight_response(&self, origin: HeaderValue) -> Response {
        let mut response = empty_response(StatusCode::NO_CONTENT);
        let map = response.headers_mut();
        self.insert_common(map, origin);

        let methods: Vec<_> = self.config.allowed_methods.iter().map(Method::as_str).collect();
        if let Ok(value) = HeaderValue::from_str(&methods.join(", ")) {
            map.insert(headers::ALLOW_METHODS, value);
        }
        if !self.config.allowed_headers.is_empty() {
            let list: Vec<_> = self.config.allowed_headers.iter().map(String::as_str).collect();
            if let Ok(value) = HeaderValue::from_str(&list.join(", ")) {
                map.insert(headers::ALLOW_HEADERS, value);
            }
        }
        if let Some(max_age) = self.config.max_age {
            map.insert(headers::MAX_AGE, HeaderValue::from(max_age.as_secs()));
        }
        response
    }

    fn decorate(&self, response: &mut Response, origin: HeaderValue) {
        let map = response.headers_mut();
        self.insert_common(map, origin);
        if !self.config.expose_headers.is_empty() {
            let list: Vec<_> = self.config.expose_headers.iter().map(String::as_str).collect();
            if let Ok(value) = HeaderValue::from_str(&list.join(", ")) {
                map.insert(headers::EXPOSE_HEADERS, value);
            }
        }
    }
}

impl Middleware for CorsMiddleware {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let Some(origin) = self.allowed_origin(&request) else {
                return next.run(ctx, request).await;
            };

            if request.method() == Method::OPTIONS {
                tracing::debug!(request_id = %ctx.request_id(), "answered CORS preflight");
                return self.preflight_response(origin);
            }

            let mut response = next.run(ctx, request).await;
            self.decorate(&mut response, origin);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::Request as HttpRequest;
    use http_body_util::Full;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn request(method: Method, origin: Option<&str>) -> Request {
        let mut builder = HttpRequest::builder().method(method).uri("/test");
        if let Some(origin) = origin {
            builder = builder.header(headers::ORIGIN, origin);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    fn handler<'a>(called: Arc<AtomicBool>) -> Next<'a> {
        Next::handler(move |_ctx, _req| {
            called.store(true, Ordering::SeqCst);
            Box::pin(async { empty_response(StatusCode::OK) })
        })
    }

    fn app_cors() -> CorsMiddleware {
        CorsMiddleware::builder()
            .allow_origin("https://app.example.com")
            .allow_methods([Method::GET, Method::POST])
            .expose_headers(["X-Trace-ID"])
            .allow_credentials(true)
            .max_age(Duration::from_secs(600))
            .build()
            .unwrap()
    }

    #[test]
    fn test_credentials_with_wildcard_rejected() {
        let err = CorsMiddleware::builder()
            .allow_any_origin()
            .allow_credentials(true)
            .build()
            .unwrap_err();
        assert_eq!(err, CorsError::CredentialsWithWildcard);

        let err = CorsMiddleware::builder()
            .allow_origins(["https://a.example", "*"])
            .allow_credentials(true)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let cors = CorsMiddleware::builder().build().unwrap();
        assert_eq!(cors.config().allowed_origins(), &AllowedOrigins::List(BTreeSet::new()));
        assert!(!cors.config().allow_credentials());
        assert_eq!(cors.name(), "cors");
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let cors = app_cors();
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = MiddlewareContext::new();

        let response = cors
            .process(
                &mut ctx,
                request(Method::OPTIONS, Some("https://app.example.com")),
                handler(called.clone()),
            )
            .await;

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!called.load(Ordering::SeqCst));
        let h = response.headers();
        assert_eq!(h.get(headers::ALLOW_ORIGIN).unwrap(), "https://app.example.com");
        assert_eq!(h.get(headers::ALLOW_METHODS).unwrap(), "GET, POST");
        assert_eq!(h.get(headers::ALLOW_CREDENTIALS).unwrap(), "true");
        assert_eq!(h.get(headers::MAX_AGE).unwrap(), "600");
    }

    #[tokio::test]
    async fn test_simple_request_gets_headers() {
        let cors = app_cors();
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = MiddlewareContext::new();

        let response = cors
            .process(
                &mut ctx,
                request(Method::GET, Some("https://app.example.com")),
                handler(called.clone()),
            )
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(
            response.headers().get(headers::ALLOW_ORIGIN).unwrap(),
            "https://app.example.com"
        );
        assert_eq!(response.headers().get(headers::EXPOSE_HEADERS).unwrap(), "x-trace-id");
        assert!(response.headers().get(headers::ALLOW_METHODS).is_none());
    }

    #[tokio::test]
    async fn test_disallowed_origin_passes_through() {
        let cors = app_cors();
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = MiddlewareContext::new();

        let response = cors
            .process(
                &mut ctx,
                request(Method::OPTIONS, Some("https://evil.example.com")),
                handler(called.clone()),
            )
            .await;

        assert!(called.load(Ordering::SeqCst));
        assert!(response.headers().get(headers::ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_missing_origin_passes_through() {
        let cors = CorsMiddleware::builder().allow_any_origin().build().unwrap();
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = MiddlewareContext::new();

        let response = cors
            .process(&mut ctx, request(Method::GET, None), handler(called.clone()))
            .await;

        assert!(called.load(Ordering::SeqCst));
        assert!(response.headers().get(headers::ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_wildcard_origin() {
        let cors = CorsMiddleware::builder().allow_any_origin().build().unwrap();
        let mut ctx = MiddlewareContext::new();

        let response = cors
            .process(
                &mut ctx,
                request(Method::GET, Some("https://anywhere.example")),
                handler(Arc::new(AtomicBool::new(false))),
            )
            .await;

        assert_eq!(response.headers().get(headers::ALLOW_ORIGIN).unwrap(), "*");
        assert!(response.headers().get(headers::ALLOW_CREDENTIALS).is_none());
    }
}
