//! Feature gate stage.
//!
//! Binds path patterns to named flags in a shared [`FeatureFlags`] table.
//! A request whose path matches a gate whose flag is off is answered with
//! `503 SERVICE_UNAVAILABLE` and `details.feature` naming the flag. The
//! table is published on the context so later stages can branch on flags
//! with [`feature_enabled`].
//!
//! The stage is optional and sits after CORS when configured, so preflight
//! requests for gated routes are still answered.

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_control::FeatureFlags;
use bastion_core::ApiError;
use std::sync::Arc;

/// A flag bound to a path pattern. A trailing `*` matches by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureGate {
    pattern: String,
    flag: String,
}

impl FeatureGate {
    /// Creates a gate.
    pub fn new(pattern: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            flag: flag.into(),
        }
    }

    /// Returns the flag name.
    pub fn flag(&self) -> &str {
        &self.flag
    }

    fn matches(&self, path: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == self.pattern,
        }
    }
}

/// Reports whether `flag` is on for this request.
///
/// Without a feature gate in the pipeline every flag reads as on.
pub fn feature_enabled(ctx: &MiddlewareContext, flag: &str) -> bool {
    ctx.get_extension::<Arc<FeatureFlags>>()
        .map_or(true, |flags| flags.is_enabled(flag))
}

/// Rejects requests to routes whose feature is switched off.
#[derive(Debug)]
pub struct FeatureGateMiddleware {
    flags: Arc<FeatureFlags>,
    gates: Vec<FeatureGate>,
}

impl FeatureGateMiddleware {
    /// Creates a stage with no gates.
    #[must_use]
    pub fn new(flags: Arc<FeatureFlags>) -> Self {
        Self {
            flags,
            gates: Vec::new(),
        }
    }

    /// Gates `pattern` behind `flag`. The first matching gate wins.
    #[must_use]
    pub fn gate(mut self, pattern: impl Into<String>, flag: impl Into<String>) -> Self {
        self.gates.push(FeatureGate::new(pattern, flag));
        self
    }

    /// Returns the flag table.
    #[must_use]
    pub fn flags(&self) -> &Arc<FeatureFlags> {
        &self.flags
    }

    fn gate_for(&self, path: &str) -> Option<&FeatureGate> {
        self.gates.iter().find(|gate| gate.matches(path))
    }
}

impl Middleware for FeatureGateMiddleware {
    fn name(&self) -> &'static str {
        "feature_gate"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            ctx.set_extension(Arc::clone(&self.flags));

            if let Some(gate) = self.gate_for(request.uri().path()) {
                if !self.flags.is_enabled(gate.flag()) {
                    tracing::info!(
                        request_id = %ctx.request_id(),
                        path = %request.uri().path(),
                        feature = %gate.flag(),
                        "feature disabled, request rejected"
                    );
                    metrics::counter!("bastion_feature_gated_total", "feature" => gate.flag().to_string())
                        .increment(1);

                    let error = ApiError::service_unavailable("Feature is disabled", None)
                        .with_detail("feature", gate.flag());
                    return Response::from_error(error, ctx);
                }
            }

            next.run(ctx, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::empty_response;
    use bytes::Bytes;
    use http::{Request as HttpRequest, StatusCode};
    use http_body_util::{BodyExt, Full};

    fn request(path: &str) -> Request {
        HttpRequest::builder()
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn flags() -> Arc<FeatureFlags> {
        let flags = FeatureFlags::new();
        flags.register("export", "CSV export", false);
        flags.register("search", "full-text search", true);
        Arc::new(flags)
    }

    fn ok<'a>() -> Next<'a> {
        Next::handler(|_ctx, _req| Box::pin(async { empty_response(StatusCode::OK) }))
    }

    #[tokio::test]
    async fn test_disabled_flag_rejects() {
        let middleware = FeatureGateMiddleware::new(flags()).gate("/api/export*", "export");
        let mut ctx = MiddlewareContext::new();

        let response = middleware.process(&mut ctx, request("/api/export/csv"), ok()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "SERVICE_UNAVAILABLE");
        assert_eq!(json["error"]["details"]["feature"], "export");
    }

    #[tokio::test]
    async fn test_enabled_and_ungated_paths_pass() {
        let middleware = FeatureGateMiddleware::new(flags())
            .gate("/api/export*", "export")
            .gate("/api/search", "search");

        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request("/api/search"), ok()).await;
        assert_eq!(response.status(), StatusCode::OK);

        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request("/api/users"), ok()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_toggle_takes_effect_immediately() {
        let middleware = FeatureGateMiddleware::new(flags()).gate("/api/export", "export");

        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request("/api/export"), ok()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        middleware.flags().enable("export").unwrap();
        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request("/api/export"), ok()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unregistered_flag_rejects() {
        let middleware = FeatureGateMiddleware::new(flags()).gate("/beta*", "beta");
        let mut ctx = MiddlewareContext::new();
        let response = middleware.process(&mut ctx, request("/beta/home"), ok()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_later_stages_see_flags() {
        let middleware = FeatureGateMiddleware::new(flags());
        let mut ctx = MiddlewareContext::new();
        assert!(feature_enabled(&ctx, "export"));

        let next = Next::handler(|ctx, _req| {
            let status = if feature_enabled(ctx, "export") {
                StatusCode::OK
            } else {
                StatusCode::NO_CONTENT
            };
            Box::pin(async move { empty_response(status) })
        });
        let response = middleware.process(&mut ctx, request("/"), next).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(feature_enabled(&ctx, "search"));
    }
}
