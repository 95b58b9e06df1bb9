//! Bearer-token authentication.
//!
//! Reads `Authorization: Bearer <jwt>`, validates it as an access token with
//! the configured [`JwtVerifier`] and publishes the claims on the context,
//! which makes `user.id` and `user.roles` available to later stages.
//!
//! A missing, malformed or invalid token is answered with
//! `401 UNAUTHORIZED` and `WWW-Authenticate: Bearer`; later stages and the
//! handler do not run. Paths registered as optional pass through
//! anonymously instead. Paths that skip authentication entirely are
//! configured on the pipeline with
//! [`PipelineBuilder::add_stage_skipping`](crate::pipeline::PipelineBuilder::add_stage_skipping).

use crate::context::MiddlewareContext;
use crate::middleware::{BoxFuture, Middleware, Next};
use crate::skip::SkipPaths;
use crate::types::{Request, Response, ResponseExt};
use bastion_auth::{AuthError, Claims, JwtVerifier};
use bastion_core::ApiError;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use std::sync::Arc;

const BEARER: &str = "bearer";

/// Extracts the bearer token from the `Authorization` header.
///
/// The scheme is matched case-insensitively. An empty token is reported as
/// [`AuthError::MissingToken`].
pub fn bearer_token(request: &Request) -> Result<&str, AuthError> {
    let value = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?
        .trim();

    if value.is_empty() {
        return Err(AuthError::MissingToken);
    }

    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.eq_ignore_ascii_case(BEARER) {
        return Err(AuthError::MalformedHeader);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

/// Validates bearer tokens and publishes their claims.
#[derive(Debug, Clone)]
pub struct AuthenticateMiddleware {
    verifier: Arc<JwtVerifier>,
    optional: SkipPaths,
}

impl AuthenticateMiddleware {
    /// Creates the stage with a shared verifier.
    #[must_use]
    pub fn new(verifier: Arc<JwtVerifier>) -> Self {
        Self {
            verifier,
            optional: SkipPaths::default(),
        }
    }

    /// Paths where a missing or invalid token is tolerated.
    ///
    /// A valid token on these paths is still verified and published.
    #[must_use]
    pub fn optional_paths(mut self, paths: SkipPaths) -> Self {
        self.optional = paths;
        self
    }

    /// Returns the verifier.
    #[must_use]
    pub fn verifier(&self) -> &Arc<JwtVerifier> {
        &self.verifier
    }

    fn authenticate(&self, request: &Request) -> Result<Claims, AuthError> {
        let token = bearer_token(request)?;
        self.verifier.validate_access(token)
    }
}

impl Middleware for AuthenticateMiddleware {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn process<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        request: Request,
        next: Next<'a>,
    ) -> BoxFuture<'a, Response> {
        Box::pin(async move {
            match self.authenticate(&request) {
                Ok(claims) => {
                    tracing::debug!(
                        request_id = %ctx.request_id(),
                        user_id = %claims.user_id,
                        "request authenticated"
                    );
                    if let Err(e) = ctx.set_claims(claims) {
                        tracing::error!(request_id = %ctx.request_id(), error = %e, "claims already published");
                        return Response::from_error(ApiError::internal("Internal server error"), ctx);
                    }
                }
                Err(e) if self.optional.matches(request.uri().path()) => {
                    tracing::debug!(
                        request_id = %ctx.request_id(),
                        reason = e.reason(),
                        "continuing anonymously on optional path"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %ctx.request_id(),
                        method = %request.method(),
                        path = %request.uri().path(),
                        reason = e.reason(),
                        error = %e,
                        "authentication failed"
                    );
                    metrics::counter!("bastion_auth_failures_total", "reason" => e.reason())
                        .increment(1);

                    let error = if e.is_credential_error() {
                        ApiError::unauthorized("Invalid or missing credentials")
                    } else {
                        ApiError::internal("Internal server error")
                    };
                    let mut response = Response::from_error(error, ctx);
                    if e.is_credential_error() {
                        response.set_header(WWW_AUTHENTICATE, "Bearer");
                    }
                    return response;
                }
            }

            next.run(ctx, request).await
        })
    }
}
