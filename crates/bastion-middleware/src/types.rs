//! Request and response types used throughout the pipeline.

use crate::context::MiddlewareContext;
use bastion_core::ApiError;
use http::header::HeaderName;
use http::HeaderValue;

pub use bastion_core::{Request, Response};

/// Response helpers shared by the stages.
pub trait ResponseExt {
    /// Renders a middleware-originated failure as an error envelope,
    /// correlated with the request's trace id.
    fn from_error(error: ApiError, ctx: &MiddlewareContext) -> Response;

    /// Sets a header from any displayable value, skipping values that are
    /// not valid header text.
    fn set_header(&mut self, name: HeaderName, value: impl ToString);
}

impl ResponseExt for Response {
    fn from_error(error: ApiError, ctx: &MiddlewareContext) -> Response {
        error.into_response(ctx.trace_id())
    }

    fn set_header(&mut self, name: HeaderName, value: impl ToString) {
        if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
            self.headers_mut().insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::ErrorKind;
    use http::StatusCode;

    #[test]
    fn test_from_error_uses_envelope() {
        let ctx = MiddlewareContext::new();
        let response = Response::from_error(ApiError::forbidden("nope"), &ctx);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(ErrorKind::Forbidden.status(), response.status());
    }

    #[test]
    fn test_set_header_skips_invalid_values() {
        let mut response = bastion_core::empty_response(StatusCode::OK);
        response.set_header(HeaderName::from_static("x-count"), 42);
        response.set_header(HeaderName::from_static("x-bad"), "line\nbreak");
        assert_eq!(response.headers().get("x-count").unwrap(), "42");
        assert!(response.headers().get("x-bad").is_none());
    }
}
