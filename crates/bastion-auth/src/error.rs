//! Authentication errors.

use thiserror::Error;

/// Errors raised while configuring the verifier or validating a token.
///
/// Every validation variant maps to `401 UNAUTHORIZED` at the edge;
/// configuration variants surface at construction time only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No bearer token was presented.
    #[error("missing bearer token")]
    MissingToken,

    /// The `Authorization` header is not `Bearer <token>`.
    #[error("malformed authorization header")]
    MalformedHeader,

    /// The token could not be parsed.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The token's `alg` is not the configured algorithm.
    #[error("token algorithm does not match the configured algorithm")]
    AlgorithmMismatch,

    /// Signature verification failed.
    #[error("invalid token signature")]
    InvalidSignature,

    /// `exp` is not in the future.
    #[error("token has expired")]
    Expired,

    /// `nbf` is in the future.
    #[error("token is not yet valid")]
    NotYetValid,

    /// `iss` does not match the configured issuer.
    #[error("invalid token issuer")]
    InvalidIssuer,

    /// `aud` does not include the configured audience.
    #[error("invalid token audience")]
    InvalidAudience,

    /// A required registered claim is absent.
    #[error("missing required claim: {0}")]
    MissingClaim(String),

    /// The temporal claims violate `nbf <= iat <= exp`.
    #[error("inconsistent token timestamps")]
    InconsistentTimestamps,

    /// An access token was used where a refresh token was required, or the reverse.
    #[error("expected a {expected} token")]
    WrongTokenType {
        /// The token type the operation requires.
        expected: &'static str,
    },

    /// The configured key does not belong to the configured algorithm family.
    #[error("key type does not match algorithm {algorithm}")]
    KeyMismatch {
        /// The configured algorithm.
        algorithm: &'static str,
    },

    /// Key material could not be loaded.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The verifier holds only a public key and cannot sign.
    #[error("signing key unavailable")]
    SigningUnavailable,

    /// Token encoding failed.
    #[error("failed to sign token: {0}")]
    Signing(String),
}

impl AuthError {
    /// Returns a short, stable label used for logs and metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedHeader => "malformed_header",
            Self::Malformed(_) => "malformed_token",
            Self::AlgorithmMismatch => "algorithm_mismatch",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::InvalidIssuer => "invalid_issuer",
            Self::InvalidAudience => "invalid_audience",
            Self::MissingClaim(_) => "missing_claim",
            Self::InconsistentTimestamps => "inconsistent_timestamps",
            Self::WrongTokenType { .. } => "wrong_token_type",
            Self::KeyMismatch { .. } => "key_mismatch",
            Self::InvalidKey(_) => "invalid_key",
            Self::SigningUnavailable => "signing_unavailable",
            Self::Signing(_) => "signing_failed",
        }
    }

    /// Returns `true` for errors caused by the presented credentials.
    #[must_use]
    pub const fn is_credential_error(&self) -> bool {
        !matches!(
            self,
            Self::KeyMismatch { .. }
                | Self::InvalidKey(_)
                | Self::SigningUnavailable
                | Self::Signing(_)
        )
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer,
            ErrorKind::InvalidAudience => Self::InvalidAudience,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                Self::AlgorithmMismatch
            }
            ErrorKind::MissingRequiredClaim(claim) => Self::MissingClaim(claim.clone()),
            ErrorKind::InvalidRsaKey(msg) => Self::InvalidKey(msg.clone()),
            ErrorKind::InvalidKeyFormat => Self::InvalidKey("unrecognized key format".to_string()),
            _ => Self::Malformed(err.to_string()),
        }
    }
}
