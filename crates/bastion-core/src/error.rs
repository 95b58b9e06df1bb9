//! Error taxonomy for the request-governance stack.
//!
//! Every failure produced by a middleware stage is an [`ApiError`]. The
//! error's [`ErrorKind`] fixes the HTTP status, the symbolic code written
//! into the envelope and whether a client may retry.
//!
//! | Symbol | HTTP | Retryable |
//! |---|---|---|
//! | `INVALID_INPUT` | 400 | no |
//! | `UNAUTHORIZED` | 401 | no |
//! | `FORBIDDEN` | 403 | no |
//! | `NOT_FOUND` | 404 | no |
//! | `CONFLICT` | 409 | no |
//! | `RATE_LIMIT_EXCEEDED` | 429 | yes |
//! | `INTERNAL_ERROR` | 500 | no |
//! | `SERVICE_UNAVAILABLE` | 503 | yes |
//! | `TIMEOUT` | 504 | yes |

use crate::envelope::{Envelope, ErrorBody};
use crate::types::Response;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`ApiError`].
pub type ApiResult<T> = Result<T, ApiError>;

/// Symbolic error codes carried in the envelope's `error.code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed or semantically invalid input.
    InvalidInput,
    /// Missing or invalid credentials.
    Unauthorized,
    /// Authenticated but not permitted.
    Forbidden,
    /// Resource does not exist.
    NotFound,
    /// Conflicting state, e.g. a duplicate identifier.
    Conflict,
    /// The caller exceeded its request budget.
    RateLimitExceeded,
    /// Unexpected server-side failure.
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
    /// A dependency is unavailable (open circuit).
    ServiceUnavailable,
    /// The request did not complete in time.
    Timeout,
}

impl ErrorKind {
    /// Returns the HTTP status code for this kind.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::InvalidInput => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Returns `true` if clients may retry a request that failed with this kind.
    ///
    /// Only rate limiting, unavailability and timeouts are retryable.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded | Self::ServiceUnavailable | Self::Timeout
        )
    }

    /// Returns the stable symbol written to `error.code`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Returns all kinds, in status order.
    #[must_use]
    pub const fn all() -> [ErrorKind; 9] {
        [
            Self::InvalidInput,
            Self::Unauthorized,
            Self::Forbidden,
            Self::NotFound,
            Self::Conflict,
            Self::RateLimitExceeded,
            Self::Internal,
            Self::ServiceUnavailable,
            Self::Timeout,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, client-facing error.
///
/// `ApiError` is what middleware stages produce when they refuse a request.
/// It renders to the JSON envelope through [`ApiError::into_response`].
///
/// # Example
///
/// ```
/// use bastion_core::{ApiError, ErrorKind};
///
/// let err = ApiError::invalid_input("email is malformed")
///     .with_detail("field", "email");
/// assert_eq!(err.kind(), ErrorKind::InvalidInput);
/// assert_eq!(err.status().as_u16(), 400);
/// ```
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    details: Option<Map<String, Value>>,
    retry_after: Option<Duration>,
}

impl ApiError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    /// Creates an `INVALID_INPUT` error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    /// Creates an `UNAUTHORIZED` error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Creates a `FORBIDDEN` error.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// Creates a `NOT_FOUND` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Creates a `CONFLICT` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Creates a `RATE_LIMIT_EXCEEDED` error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimitExceeded, message)
        }
    }

    /// Creates an `INTERNAL_ERROR` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Creates a `SERVICE_UNAVAILABLE` error.
    #[must_use]
    pub fn service_unavailable(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::ServiceUnavailable, message)
        }
    }

    /// Creates a `TIMEOUT` error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Adds a single entry to the `details` map.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replaces the `details` map.
    #[must_use]
    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the `Retry-After` hint emitted with the response.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the optional details map.
    #[must_use]
    pub fn details(&self) -> Option<&Map<String, Value>> {
        self.details.as_ref()
    }

    /// Returns the retry hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Returns the HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.kind.status()
    }

    /// Returns `true` if the client may retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Converts the error into the `error` object of the envelope.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }

    /// Builds the error envelope, optionally correlated with a trace.
    #[must_use]
    pub fn to_envelope(&self, trace_id: Option<&str>) -> Envelope {
        let envelope = Envelope::failure(self.status(), self.to_body());
        match trace_id {
            Some(trace_id) => envelope.with_trace_id(trace_id),
            None => envelope,
        }
    }

    /// Renders the error as an HTTP response.
    ///
    /// A `Retry-After` header (whole seconds, rounded up) is added when the
    /// error carries a retry hint.
    #[must_use]
    pub fn into_response(self, trace_id: Option<&str>) -> Response {
        let mut response = self.to_envelope(trace_id).into_response();
        if let Some(retry_after) = self.retry_after {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response.headers_mut().insert(
                http::header::RETRY_AFTER,
                http::HeaderValue::from(secs.max(1)),
            );
        }
        response
    }
}
