//! # Bastion Core
//!
//! Core types shared by every crate of the Bastion request-governance stack.
//!
//! - [`ErrorKind`] - The closed set of symbolic error codes with their HTTP
//!   status and retry semantics
//! - [`ApiError`] - A structured error that renders as the response envelope
//! - [`Envelope`] - The uniform JSON body used for success and error responses
//! - [`RequestId`] - Per-request identifier (propagated or UUID v7)
//! - [`Request`] / [`Response`] - HTTP types used by the pipeline
//!
//! ## Envelope shape
//!
//! ```json
//! {
//!   "code": 429,
//!   "message": "error",
//!   "error": { "code": "RATE_LIMIT_EXCEEDED", "message": "rate limit exceeded" },
//!   "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
//!   "timestamp": "2024-05-01T12:00:00Z"
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/bastion-core/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod envelope;
mod error;
mod request_id;
mod types;

pub use envelope::{Envelope, EnvelopeMeta, ErrorBody, Outcome};
pub use error::{ApiError, ApiResult, ErrorKind};
pub use request_id::{RequestId, REQUEST_ID_HEADER};
pub use types::{client_ip, empty_response, RemoteAddr, Request, Response};
