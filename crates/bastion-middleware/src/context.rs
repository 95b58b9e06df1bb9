//! The per-request context bag.
//!
//! [`MiddlewareContext`] carries the values stages publish for later stages
//! and the handler:
//!
//! | Key | Accessor | Written by |
//! |---|---|---|
//! | `request.id` | [`MiddlewareContext::request_id`] | pipeline entry |
//! | `sampling.decision` | [`MiddlewareContext::sampling_decision`] | Sampling |
//! | `trace.id`, `span.id` | [`MiddlewareContext::trace_id`], [`MiddlewareContext::span_id`] | Tracing |
//! | `claims` | [`MiddlewareContext::claims`] | Authenticate |
//! | `user.id`, `user.roles` | [`MiddlewareContext::user_id`], [`MiddlewareContext::user_roles`] | Authenticate |
//!
//! The setters are crate-private and refuse to overwrite a value that is
//! already present. Unset keys read as `None`. Application code can attach
//! its own data through the typed extension map.

use bastion_auth::Claims;
use bastion_core::{RequestId, REQUEST_ID_HEADER};
use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::types::Request;

/// Context key names, as used in diagnostics.
pub mod keys {
    /// Request identifier.
    pub const REQUEST_ID: &str = "request.id";
    /// Trace identifier.
    pub const TRACE_ID: &str = "trace.id";
    /// Span identifier.
    pub const SPAN_ID: &str = "span.id";
    /// Sampling decision.
    pub const SAMPLING_DECISION: &str = "sampling.decision";
    /// Verified token claims.
    pub const CLAIMS: &str = "claims";
}

/// Errors raised by context writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The key was already written by an earlier stage.
    #[error("context key '{key}' is already set")]
    AlreadySet {
        /// The key that was written twice.
        key: &'static str,
    },
}

/// Context that flows through the middleware pipeline.
///
/// # Example
///
/// ```
/// use bastion_middleware::context::MiddlewareContext;
///
/// #[derive(Debug, PartialEq)]
/// struct Tenant(&'static str);
///
/// let mut ctx = MiddlewareContext::new();
/// assert!(ctx.trace_id().is_none());
/// assert!(ctx.claims().is_none());
///
/// ctx.set_extension(Tenant("acme"));
/// assert_eq!(ctx.get_extension::<Tenant>(), Some(&Tenant("acme")));
/// ```
#[derive(Debug)]
pub struct MiddlewareContext {
    request_id: RequestId,
    trace_id: Option<String>,
    span_id: Option<String>,
    sampling_decision: Option<bool>,
    claims: Option<Claims>,
    started_at: Instant,
    cancellation: CancellationToken,
    extensions: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MiddlewareContext {
    /// Creates a context with a fresh request id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_request_id(RequestId::new())
    }

    /// Creates a context with a specific request id.
    #[must_use]
    pub fn with_request_id(request_id: RequestId) -> Self {
        Self {
            request_id,
            trace_id: None,
            span_id: None,
            sampling_decision: None,
            claims: None,
            started_at: Instant::now(),
            cancellation: CancellationToken::new(),
            extensions: HashMap::new(),
        }
    }

    /// Creates the context for an inbound request.
    ///
    /// A well-formed `X-Request-ID` header is honoured; otherwise a new
    /// UUID v7 id is generated.
    #[must_use]
    pub fn for_request(request: &Request) -> Self {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(RequestId::parse)
            .unwrap_or_default();
        Self::with_request_id(request_id)
    }

    /// Ties the request to a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Returns the request id.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Returns the trace id, if tracing ran.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Returns the span id, if tracing ran.
    #[must_use]
    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    /// Returns the sampling decision, if a sampler ran.
    #[must_use]
    pub fn sampling_decision(&self) -> Option<bool> {
        self.sampling_decision
    }

    /// Returns `true` only if a sampler ran and chose to sample.
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.sampling_decision.unwrap_or(false)
    }

    /// Returns the verified claims, if the request was authenticated.
    #[must_use]
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// Returns the authenticated user id.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.user_id.as_str())
    }

    /// Returns the authenticated user's roles.
    #[must_use]
    pub fn user_roles(&self) -> Option<&BTreeSet<String>> {
        self.claims.as_ref().map(|c| &c.roles)
    }

    /// Returns the request's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns when the request entered the pipeline.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Returns the time spent in the pipeline so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub(crate) fn set_trace(&mut self, trace_id: String, span_id: String) -> Result<(), ContextError> {
        if self.trace_id.is_some() {
            return Err(ContextError::AlreadySet { key: keys::TRACE_ID });
        }
        if self.span_id.is_some() {
            return Err(ContextError::AlreadySet { key: keys::SPAN_ID });
        }
        self.trace_id = Some(trace_id);
        self.span_id = Some(span_id);
        Ok(())
    }

    pub(crate) fn set_sampling_decision(&mut self, sampled: bool) -> Result<(), ContextError> {
        if self.sampling_decision.is_some() {
            return Err(ContextError::AlreadySet {
                key: keys::SAMPLING_DECISION,
            });
        }
        self.sampling_decision = Some(sampled);
        Ok(())
    }

    pub(crate) fn set_claims(&mut self, claims: Claims) -> Result<(), ContextError> {
        if self.claims.is_some() {
            return Err(ContextError::AlreadySet { key: keys::CLAIMS });
        }
        self.claims = Some(claims);
        Ok(())
    }

    /// Stores a typed extension value, replacing any previous value of
    /// the same type.
    pub fn set_extension<T: Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a typed extension value.
    #[must_use]
    pub fn get_extension<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }

    /// Removes and returns a typed extension value.
    pub fn remove_extension<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.extensions
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast().ok())
            .map(|b| *b)
    }

    /// Checks if an extension of the given type exists.
    #[must_use]
    pub fn has_extension<T: Send + Sync + 'static>(&self) -> bool {
        self.extensions.contains_key(&TypeId::of::<T>())
    }

    /// Takes an owned snapshot of the published keys for the handler.
    #[must_use]
    pub fn to_request_context(&self) -> RequestContext {
        RequestContext {
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
            sampling_decision: self.sampling_decision,
            claims: self.claims.clone(),
            started_at: self.started_at,
            cancellation: self.cancellation.clone(),
        }
    }
}

impl Default for MiddlewareContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the context handed to the application handler.
///
/// The cancellation token is shared with the pipeline: it fires when the
/// request times out or the caller cancels it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    trace_id: Option<String>,
    span_id: Option<String>,
    sampling_decision: Option<bool>,
    claims: Option<Claims>,
    started_at: Instant,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Returns the request id.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Returns the trace id.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Returns the span id.
    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    /// Returns the sampling decision.
    pub fn sampling_decision(&self) -> Option<bool> {
        self.sampling_decision
    }

    /// Returns the verified claims.
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_ref()
    }

    /// Returns the authenticated user id.
    pub fn user_id(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.user_id.as_str())
    }

    /// Returns the authenticated user's roles.
    pub fn user_roles(&self) -> Option<&BTreeSet<String>> {
        self.claims.as_ref().map(|c| &c.roles)
    }

    /// Returns the cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns the time since the request entered the pipeline.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_auth::Audience;
    use bytes::Bytes;
    use http::Request as HttpRequest;
    use http_body_util::Full;

    fn claims(user: &str) -> Claims {
        Claims {
            user_id: user.to_string(),
            username: None,
            email: None,
            roles: BTreeSet::from(["user".to_string()]),
            scope: None,
            issuer: "bastion".to_string(),
            audience: Audience::One("bastion-api".to_string()),
            issued_at: 1_700_000_000,
            not_before: 1_700_000_000,
            expires_at: 1_700_000_900,
            token_id: None,
            token_type: bastion_auth::TokenType::Access,
        }
    }

    #[test]
    fn test_unset_keys_read_as_none() {
        let ctx = MiddlewareContext::new();
        assert!(ctx.trace_id().is_none());
        assert!(ctx.span_id().is_none());
        assert!(ctx.sampling_decision().is_none());
        assert!(!ctx.is_sampled());
        assert!(ctx.claims().is_none());
        assert!(ctx.user_id().is_none());
        assert!(ctx.user_roles().is_none());
    }

    #[test]
    fn test_keys_are_write_once() {
        let mut ctx = MiddlewareContext::new();
        ctx.set_trace("t1".to_string(), "s1".to_string()).unwrap();
        assert_eq!(
            ctx.set_trace("t2".to_string(), "s2".to_string()),
            Err(ContextError::AlreadySet { key: keys::TRACE_ID })
        );
        assert_eq!(ctx.trace_id(), Some("t1"));
        assert_eq!(ctx.span_id(), Some("s1"));

        ctx.set_sampling_decision(false).unwrap();
        assert!(ctx.set_sampling_decision(true).is_err());
        assert_eq!(ctx.sampling_decision(), Some(false));

        ctx.set_claims(claims("u-1")).unwrap();
        assert!(ctx.set_claims(claims("u-2")).is_err());
        assert_eq!(ctx.user_id(), Some("u-1"));
        assert!(ctx.user_roles().unwrap().contains("user"));
    }

    #[test]
    fn test_for_request_honours_header() {
        let request = HttpRequest::builder()
            .uri("/")
            .header(REQUEST_ID_HEADER, "req-abc")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(MiddlewareContext::for_request(&request).request_id().as_str(), "req-abc");

        let request = HttpRequest::builder()
            .uri("/")
            .header(REQUEST_ID_HEADER, "has space")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_ne!(MiddlewareContext::for_request(&request).request_id().as_str(), "has space");
    }

    #[test]
    fn test_extensions() {
        #[derive(Debug, Clone, PartialEq)]
        struct MyExtension {
            value: i32,
        }

        let mut ctx = MiddlewareContext::new();
        assert!(!ctx.has_extension::<MyExtension>());

        ctx.set_extension(MyExtension { value: 42 });
        assert_eq!(ctx.get_extension::<MyExtension>(), Some(&MyExtension { value: 42 }));

        let removed = ctx.remove_extension::<MyExtension>();
        assert_eq!(removed, Some(MyExtension { value: 42 }));
        assert!(!ctx.has_extension::<MyExtension>());
    }

    #[test]
    fn test_request_context_snapshot_shares_cancellation() {
        let mut ctx = MiddlewareContext::new();
        ctx.set_claims(claims("u-9")).unwrap();
        let snapshot = ctx.to_request_context();

        assert_eq!(snapshot.user_id(), Some("u-9"));
        assert_eq!(snapshot.request_id(), ctx.request_id());
        assert!(!snapshot.cancellation().is_cancelled());

        ctx.cancellation().cancel();
        assert!(snapshot.cancellation().is_cancelled());
    }

    #[test]
    fn test_elapsed_time() {
        let ctx = MiddlewareContext::new();
        std::thread::sleep(Duration::from_millis(10));
        assert!(ctx.elapsed() >= Duration::from_millis(10));
    }
}
