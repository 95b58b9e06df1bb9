//! HTTP types used throughout the pipeline.

use bytes::Bytes;
use http::StatusCode;
use http_body_util::Full;
use std::net::SocketAddr;

/// The HTTP request type used in the middleware pipeline.
///
/// This is a standard `http::Request` with a `Full<Bytes>` body.
pub type Request = http::Request<Full<Bytes>>;

/// The HTTP response type used in the middleware pipeline.
///
/// This is a standard `http::Response` with a `Full<Bytes>` body.
pub type Response = http::Response<Full<Bytes>>;

/// Peer address of the connection, stored in request extensions by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// Resolves the client address of a request.
///
/// Order: first hop of `X-Forwarded-For`, then `X-Real-IP`, then the
/// [`RemoteAddr`] extension.
#[must_use]
pub fn client_ip<B>(request: &http::Request<B>) -> Option<String> {
    let headers = request.headers();
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(first.to_string());
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(real_ip.to_string());
    }
    request
        .extensions()
        .get::<RemoteAddr>()
        .map(|addr| addr.0.ip().to_string())
}

/// Creates a response with an empty body.
#[must_use]
pub fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}
