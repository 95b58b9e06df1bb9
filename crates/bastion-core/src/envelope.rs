//! The uniform JSON response envelope.

use crate::error::ErrorKind;
use crate::types::Response;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, HeaderValue, StatusCode};
use http_body_util::Full;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body written when an envelope cannot be serialized.
const SERIALIZATION_FALLBACK: &str = r#"{"code":500,"message":"error","error":{"code":"INTERNAL_ERROR","message":"failed to serialize response"}}"#;

/// The `message` field of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The request succeeded.
    Success,
    /// The request failed; `error` is populated.
    Error,
}

/// The `error` object of a failed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable symbolic code.
    pub code: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Optional field-level details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

/// Optional metadata attached to an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    /// Request identifier for support correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// API or service version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Uniform response body for success and error responses.
///
/// # Example
///
/// ```
/// use bastion_core::{Envelope, Outcome};
/// use http::StatusCode;
///
/// let envelope = Envelope::success(StatusCode::OK, serde_json::json!({"status": "healthy"}));
/// assert_eq!(envelope.code, 200);
/// assert_eq!(envelope.message, Outcome::Success);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    /// HTTP status code, repeated in the body.
    pub code: u16,
    /// `"success"` or `"error"`.
    pub message: Outcome,
    /// Payload of a successful response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure description of an error response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Trace identifier, when tracing was active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// When the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Optional metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<EnvelopeMeta>,
}

impl<T> Envelope<T> {
    /// Creates a success envelope carrying `data`.
    #[must_use]
    pub fn success(status: StatusCode, data: T) -> Self {
        Self {
            code: status.as_u16(),
            message: Outcome::Success,
            data: Some(data),
            error: None,
            trace_id: None,
            timestamp: Utc::now(),
            meta: None,
        }
    }

    /// Creates an error envelope.
    #[must_use]
    pub fn failure(status: StatusCode, error: ErrorBody) -> Self {
        Self {
            code: status.as_u16(),
            message: Outcome::Error,
            data: None,
            error: Some(error),
            trace_id: None,
            timestamp: Utc::now(),
            meta: None,
        }
    }

    /// Attaches a trace identifier.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attaches metadata.
    #[must_use]
    pub fn with_meta(mut self, meta: EnvelopeMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Returns `true` for error envelopes.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.message == Outcome::Error
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope into a JSON response with status `code`.
    #[must_use]
    pub fn into_response(self) -> Response {
        let (status, body) = match serde_json::to_vec(&self) {
            Ok(body) => (
                StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                Bytes::from(body),
            ),
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Bytes::from_static(SERIALIZATION_FALLBACK.as_bytes()),
            ),
        };

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}
