//! Request identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Header carrying the request identifier in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest inbound request id that is accepted verbatim.
const MAX_LEN: usize = 128;

/// A per-request identifier.
///
/// Generated identifiers are UUID v7, which embed a Unix timestamp and sort
/// by creation time. Identifiers supplied by a client or upstream proxy are
/// kept as-is when they pass [`RequestId::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Creates a new unique request ID using UUID v7.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Accepts an inbound identifier.
    ///
    /// Returns `None` for empty values, values longer than 128 bytes and
    /// values containing anything other than visible ASCII.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value.len() > MAX_LEN {
            return None;
        }
        if !value.bytes().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        Some(Self(value.to_string()))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
