//! Role-based authorization.
//!
//! Routes are mapped to a [`Requirement`]: a `(resource, action)` permission
//! evaluated against the [`RbacStore`], or a set of roles of which the caller
//! needs any or all. The caller's roles come from the claims published by
//! the Authenticate stage.
//!
//! - No matching route policy: the request passes.
//! - No roles on the context: `401 UNAUTHORIZED`.
//! - Requirement not met: `403 FORBIDDEN`. The response does not name the
//!   missing permission.
//! - Inheritance cycle in the store: `500 INTERNAL_ERROR`, logged at error.
//!
//! # Example
//!
//! ```
//! use bastion_auth::RbacStore;
//! use bastion_middleware::stages::AuthorizeMiddleware;
//! use http::Method;
//! use std::sync::Arc;
//!
//! let authorize = AuthorizeMiddleware::new(Arc::new(RbacStore::with_default_policy()))
//!     .require_permission("/users", "user", "read")
//!     .route(Some(Method::DELETE), "/users/*", bastion_middleware::stages::Requirement::permission("user", "delete"))
//!     .require_any_role("/admin/*", ["admin"]);
//! assert_eq!(authorize.policies().len(), 3);
//! ```

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::types::{Request, Response, ResponseExt};
use bastion_auth::{has_all_roles, has_any_role, RbacError, RbacStore};
use bastion_core::ApiError;
use http::Method;
use std::collections::BTreeSet;
use std::sync::Arc;

/// What a caller needs to reach a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// Some effective permission of the caller's roles matches the pair.
    Permission {
        /// Resource name, or `*`.
        resource: String,
        /// Action name, or `*`.
        action: String,
    },
    /// The caller holds at least one of these roles.
    AnyRole(BTreeSet<String>),
    /// The caller holds every one of these roles.
    AllRoles(BTreeSet<String>),
}

impl Requirement {
    /// A permission requirement.
    pub fn permission(resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self::Permission {
            resource: resource.into(),
            action: action.into(),
        }
    }

    /// A requirement satisfied by any of `roles`.
    pub fn any_role<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyRole(roles.into_iter().map(Into::into).collect())
    }

    /// A requirement satisfied only by all of `roles`.
    pub fn all_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllRoles(roles.into_iter().map(Into::into).collect())
    }

    fn is_met_by(&self, store: &RbacStore, roles: &BTreeSet<String>) -> Result<bool, RbacError> {
        match self {
            Self::Permission { resource, action } => store.check_permission(roles, resource, action),
            Self::AnyRole(required) => Ok(has_any_role(roles, required)),
            Self::AllRoles(required) => Ok(has_all_roles(roles, required)),
        }
    }
}

/// A requirement bound to a path pattern and, optionally, a method.
///
/// A pattern ending in `*` matches by prefix; any other pattern matches the
/// path exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    method: Option<Method>,
    pattern: String,
    requirement: Requirement,
}

impl RoutePolicy {
    /// Creates a policy.
    pub fn new(method: Option<Method>, pattern: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            requirement,
        }
    }

    /// Returns the path pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns the method filter.
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Returns the requirement.
    pub fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    /// Returns `true` if the policy applies to the request line.
    pub fn applies_to(&self, method: &Method, path: &str) -> bool {
        if self.method.as_ref().is_some_and(|m| m != method) {
            return false;
        }
        match self.pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == self.pattern,
        }
    }
}

/// Enforces route policies against the caller's roles.
#[derive(Debug, Clone)]
pub struct AuthorizeMiddleware {
    store: Arc<RbacStore>,
    policies: Vec<RoutePolicy>,
}

impl AuthorizeMiddleware {
    /// Creates the stage over a shared store, with no route policies.
    #[must_use]
    pub fn new(store: Arc<RbacStore>) -> Self {
        Self {
            store,
            policies: Vec::new(),
        }
    }

    /// Adds a policy. Policies are checked in the order they were added and
    /// the first one that applies wins.
    #[must_use]
    pub fn route(mut self, method: Option<Method>, pattern: impl Into<String>, requirement: Requirement) -> Self {
        self.policies.push(RoutePolicy::new(method, pattern, requirement));
        self
    }

    /// Requires a permission for every method on `pattern`.
    #[must_use]
    pub fn require_permission(
        self,
        pattern: impl Into<String>,
        resource: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.route(None, pattern, Requirement::permission(resource, action))
    }

    /// Requires any of `roles` for every method on `pattern`.
    #[must_use]
    pub fn require_any_role<I, S>(self, pattern: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.route(None, pattern, Requirement::any_role(roles))
    }

    /// Requires all of `roles` for every method on `pattern`.
    #[must_use]
    pub fn require_all_roles<I, S>(self, pattern: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.route(None, pattern, Requirement::all_roles(roles))
    }

    /// Returns the route policies in evaluation order.
    #[must_use]
    pub fn policies(&self) -> &[RoutePolicy] {
        &self.policies
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<RbacStore> {
        &self.store
    }

    fn policy_for(&self, method: &Method, path: &str) -> Option<&RoutePolicy> {
        self.policies.iter().find(|p| p.applies_to(method, path))
    }
}

impl Middleware for AuthorizeMiddleware {
    fn name(&self) -> &'static str {
        "authorize"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            let Some(policy) = self.policy_for(request.method(), request.uri().path()) else {
                return next.run(ctx, request).await;
            };

            let roles = match ctx.user_roles() {
                Some(roles) if !roles.is_empty() => roles,
                _ => {
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        method = %request.method(),
                        path = %request.uri().path(),
                        "no roles on request for protected route"
                    );
                    return Response::from_error(ApiError::unauthorized("Authentication required"), ctx);
                }
            };

            match policy.requirement.is_met_by(&self.store, roles) {
                Ok(true) => {
                    tracing::debug!(
                        request_id = %ctx.request_id(),
                        pattern = %policy.pattern,
                        "request authorized"
                    );
                    next.run(ctx, request).await
                }
                Ok(false) => {
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        method = %request.method(),
                        path = %request.uri().path(),
                        user_id = ctx.user_id().unwrap_or_default(),
                        requirement = ?policy.requirement,
                        "authorization denied"
                    );
                    metrics::counter!("bastion_authz_denied_total").increment(1);
                    Response::from_error(ApiError::forbidden("Insufficient permissions"), ctx)
                }
                Err(e) => {
                    tracing::error!(
                        request_id = %ctx.request_id(),
                        method = %request.method(),
                        path = %request.uri().path(),
                        error = %e,
                        "authorization policy is inconsistent"
                    );
                    Response::from_error(ApiError::internal("Internal server error"), ctx)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_auth::{Claims, JwtConfig, JwtKey, JwtVerifier, Role, TokenSubject, TokenType};
    use bastion_core::empty_response;
    use bytes::Bytes;
    use http::{Request as HttpRequest, StatusCode};
    use http_body_util::{BodyExt, Full};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn claims(roles: &[&str]) -> Claims {
        let verifier =
            JwtVerifier::new(JwtConfig::default(), JwtKey::hmac("0123456789abcdef0123456789abcdef")).unwrap();
        let subject = roles
            .iter()
            .fold(TokenSubject::new("u-1"), |s, role| s.with_role(*role));
        verifier.claims_for(&subject, TokenType::Access, chrono::Utc::now().timestamp())
    }

    fn ctx_with_roles(roles: &[&str]) -> MiddlewareContext {
        let mut ctx = MiddlewareContext::new();
        ctx.set_claims(claims(roles)).unwrap();
        ctx
    }

    fn request(method: Method, path: &str) -> Request {
        HttpRequest::builder()
            .method(method)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn handler<'a>(called: Arc<AtomicBool>) -> Next<'a> {
        Next::handler(move |_ctx, _req| {
            called.store(true, Ordering::SeqCst);
            Box::pin(async { empty_response(StatusCode::OK) })
        })
    }

    fn middleware() -> AuthorizeMiddleware {
        AuthorizeMiddleware::new(Arc::new(RbacStore::with_default_policy()))
            .route(Some(Method::DELETE), "/users/*", Requirement::permission("user", "delete"))
            .require_permission("/users*", "user", "read")
            .require_all_roles("/ops/*", ["admin", "moderator"])
    }

    #[test]
    fn test_route_matching() {
        let policy = RoutePolicy::new(Some(Method::GET), "/users/*", Requirement::any_role(["user"]));
        assert!(policy.applies_to(&Method::GET, "/users/42"));
        assert!(!policy.applies_to(&Method::POST, "/users/42"));
        assert!(!policy.applies_to(&Method::GET, "/accounts"));

        let exact = RoutePolicy::new(None, "/users", Requirement::any_role(["user"]));
        assert!(exact.applies_to(&Method::PUT, "/users"));
        assert!(!exact.applies_to(&Method::PUT, "/users/1"));
    }

    #[tokio::test]
    async fn test_permitted_role_reaches_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = ctx_with_roles(&["user"]);

        let response = middleware()
            .process(&mut ctx, request(Method::GET, "/users"), handler(called.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_missing_permission_is_forbidden() {
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = ctx_with_roles(&["user"]);

        let response = middleware()
            .process(&mut ctx, request(Method::DELETE, "/users/42"), handler(called.clone()))
            .await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(!called.load(Ordering::SeqCst));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["code"], "FORBIDDEN");
        assert_eq!(json["error"]["message"], "Insufficient permissions");
        assert!(json["error"].get("details").is_none());
    }

    #[tokio::test]
    async fn test_admin_wildcard_allows_everything() {
        let mut ctx = ctx_with_roles(&["admin"]);
        let response = middleware()
            .process(&mut ctx, request(Method::DELETE, "/users/42"), handler(Arc::new(AtomicBool::new(false))))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_roles_is_unauthorized() {
        let mut anonymous = MiddlewareContext::new();
        let response = middleware()
            .process(&mut anonymous, request(Method::GET, "/users"), handler(Arc::new(AtomicBool::new(false))))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut roleless = ctx_with_roles(&[]);
        let response = middleware()
            .process(&mut roleless, request(Method::GET, "/users"), handler(Arc::new(AtomicBool::new(false))))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unknown_roles_grant_nothing() {
        let mut ctx = ctx_with_roles(&["ghost"]);
        let response = middleware()
            .process(&mut ctx, request(Method::GET, "/users"), handler(Arc::new(AtomicBool::new(false))))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_all_roles_requirement() {
        let mut partial = ctx_with_roles(&["admin"]);
        let response = middleware()
            .process(&mut partial, request(Method::GET, "/ops/drain"), handler(Arc::new(AtomicBool::new(false))))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let mut both = ctx_with_roles(&["admin", "moderator"]);
        let response = middleware()
            .process(&mut both, request(Method::GET, "/ops/drain"), handler(Arc::new(AtomicBool::new(false))))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unmatched_route_passes_anonymously() {
        let called = Arc::new(AtomicBool::new(false));
        let mut ctx = MiddlewareContext::new();
        let response = middleware()
            .process(&mut ctx, request(Method::GET, "/health"), handler(called.clone()))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_inheritance_cycle_is_internal_error() {
        let store = RbacStore::new();
        store.add_role(Role::new("a", "A")).unwrap();
        store.add_role(Role::new("b", "B").inheriting("a")).unwrap();
        store.add_inheritance("a", "b").unwrap();
        let middleware = AuthorizeMiddleware::new(Arc::new(store)).require_permission("/*", "doc", "read");

        let mut ctx = ctx_with_roles(&["b"]);
        let response = middleware
            .process(&mut ctx, request(Method::GET, "/doc"), handler(Arc::new(AtomicBool::new(false))))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
