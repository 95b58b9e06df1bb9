//! JWT issuance and verification.
//!
//! A [`JwtVerifier`] is bound to exactly one signing algorithm. Tokens whose
//! `alg` header names any other algorithm, including `none`, are rejected
//! before the signature is checked. HMAC and RSA keys cannot be mixed on a
//! single verifier.

use crate::claims::{Audience, Claims, TokenSubject, TokenType};
use crate::error::AuthError;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Minimum recommended HMAC secret length in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Supported signing algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JwtAlgorithm {
    /// HMAC with SHA-256.
    #[default]
    #[serde(rename = "HS256")]
    Hs256,
    /// HMAC with SHA-384.
    #[serde(rename = "HS384")]
    Hs384,
    /// HMAC with SHA-512.
    #[serde(rename = "HS512")]
    Hs512,
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    #[serde(rename = "RS256")]
    Rs256,
    /// RSASSA-PKCS1-v1_5 with SHA-384.
    #[serde(rename = "RS384")]
    Rs384,
    /// RSASSA-PKCS1-v1_5 with SHA-512.
    #[serde(rename = "RS512")]
    Rs512,
}

impl JwtAlgorithm {
    /// Returns `true` for the HMAC family.
    #[must_use]
    pub const fn is_hmac(self) -> bool {
        matches!(self, Self::Hs256 | Self::Hs384 | Self::Hs512)
    }

    /// Returns the JOSE name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hs256 => "HS256",
            Self::Hs384 => "HS384",
            Self::Hs512 => "HS512",
            Self::Rs256 => "RS256",
            Self::Rs384 => "RS384",
            Self::Rs512 => "RS512",
        }
    }

    const fn to_jsonwebtoken(self) -> Algorithm {
        match self {
            Self::Hs256 => Algorithm::HS256,
            Self::Hs384 => Algorithm::HS384,
            Self::Hs512 => Algorithm::HS512,
            Self::Rs256 => Algorithm::RS256,
            Self::Rs384 => Algorithm::RS384,
            Self::Rs512 => Algorithm::RS512,
        }
    }
}

impl fmt::Display for JwtAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JwtAlgorithm {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HS256" => Ok(Self::Hs256),
            "HS384" => Ok(Self::Hs384),
            "HS512" => Ok(Self::Hs512),
            "RS256" => Ok(Self::Rs256),
            "RS384" => Ok(Self::Rs384),
            "RS512" => Ok(Self::Rs512),
            _ => Err(AuthError::AlgorithmMismatch),
        }
    }
}

/// Verifier settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Expected and issued `iss`.
    pub issuer: String,
    /// Expected and issued `aud`.
    pub audience: String,
    /// Signing algorithm.
    pub algorithm: JwtAlgorithm,
    /// Access-token lifetime in seconds.
    pub access_ttl_secs: u64,
    /// Refresh-token lifetime in seconds.
    pub refresh_ttl_secs: u64,
    /// Clock-skew tolerance in seconds.
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: "bastion".to_string(),
            audience: "bastion-api".to_string(),
            algorithm: JwtAlgorithm::Hs256,
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            leeway_secs: 0,
        }
    }
}

impl JwtConfig {
    /// Sets the issuer.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Sets the audience.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Sets the algorithm.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: JwtAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Sets both token lifetimes.
    #[must_use]
    pub fn with_ttls(mut self, access_secs: u64, refresh_secs: u64) -> Self {
        self.access_ttl_secs = access_secs;
        self.refresh_ttl_secs = refresh_secs;
        self
    }
}

/// Key material for one algorithm family.
#[derive(Clone)]
pub enum JwtKey {
    /// Shared secret for HS256/384/512.
    Hmac(Vec<u8>),
    /// PEM-encoded RSA keys for RS256/384/512.
    ///
    /// Without a private key the verifier can validate but not issue.
    Rsa {
        /// PKCS#1 or PKCS#8 private key.
        private_pem: Option<Vec<u8>>,
        /// SPKI or PKCS#1 public key.
        public_pem: Vec<u8>,
    },
}

impl JwtKey {
    /// Creates an HMAC key from a shared secret.
    #[must_use]
    pub fn hmac(secret: impl AsRef<[u8]>) -> Self {
        Self::Hmac(secret.as_ref().to_vec())
    }

    /// Creates an RSA signing and verification key pair.
    #[must_use]
    pub fn rsa(private_pem: impl AsRef<[u8]>, public_pem: impl AsRef<[u8]>) -> Self {
        Self::Rsa {
            private_pem: Some(private_pem.as_ref().to_vec()),
            public_pem: public_pem.as_ref().to_vec(),
        }
    }

    /// Creates a verification-only RSA key.
    #[must_use]
    pub fn rsa_public(public_pem: impl AsRef<[u8]>) -> Self {
        Self::Rsa {
            private_pem: None,
            public_pem: public_pem.as_ref().to_vec(),
        }
    }
}

impl fmt::Debug for JwtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hmac(_) => f.write_str("JwtKey::Hmac(<redacted>)"),
            Self::Rsa { private_pem, .. } => f
                .debug_struct("JwtKey::Rsa")
                .field("private_pem", &private_pem.as_ref().map(|_| "<redacted>"))
                .finish_non_exhaustive(),
        }
    }
}

/// An access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Always `"Bearer"`.
    pub token_type: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
    /// When both tokens were issued.
    pub issued_at: DateTime<Utc>,
}

/// Issues and validates tokens for one issuer, audience and key.
///
/// Key material is immutable after construction, so a verifier can be shared
/// across requests behind an `Arc` without locking.
pub struct JwtVerifier {
    config: JwtConfig,
    encoding_key: Option<EncodingKey>,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("config", &self.config)
            .field("can_sign", &self.encoding_key.is_some())
            .finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// Creates a verifier.
    ///
    /// Fails if the key family does not match the algorithm family or the
    /// key material cannot be parsed.
    pub fn new(config: JwtConfig, key: JwtKey) -> Result<Self, AuthError> {
        let algorithm = config.algorithm;

        let (encoding_key, decoding_key) = match key {
            JwtKey::Hmac(secret) if algorithm.is_hmac() => {
                if secret.is_empty() {
                    return Err(AuthError::InvalidKey("HMAC secret is empty".to_string()));
                }
                if secret.len() < MIN_SECRET_LEN {
                    tracing::warn!(
                        len = secret.len(),
                        "JWT secret is shorter than recommended (32 bytes)"
                    );
                }
                (
                    Some(EncodingKey::from_secret(&secret)),
                    DecodingKey::from_secret(&secret),
                )
            }
            JwtKey::Rsa {
                private_pem,
                public_pem,
            } if !algorithm.is_hmac() => {
                let encoding_key = private_pem
                    .map(|pem| EncodingKey::from_rsa_pem(&pem))
                    .transpose()
                    .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
                let decoding_key = DecodingKey::from_rsa_pem(&public_pem)
                    .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
                (encoding_key, decoding_key)
            }
            _ => {
                return Err(AuthError::KeyMismatch {
                    algorithm: algorithm.as_str(),
                })
            }
        };

        let mut validation = Validation::new(algorithm.to_jsonwebtoken());
        validation.leeway = config.leeway_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.audience]);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud"]);

        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            validation,
        })
    }

    /// Returns the verifier configuration.
    #[must_use]
    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    /// Signs an arbitrary claim set with the configured key.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let key = self
            .encoding_key
            .as_ref()
            .ok_or(AuthError::SigningUnavailable)?;
        let header = Header::new(self.config.algorithm.to_jsonwebtoken());
        encode(&header, claims, key).map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Builds the claim set for `subject` issued at `issued_at` (Unix seconds).
    #[must_use]
    pub fn claims_for(&self, subject: &TokenSubject, token_type: TokenType, issued_at: i64) -> Claims {
        let ttl = match token_type {
            TokenType::Access => self.config.access_ttl_secs,
            TokenType::Refresh => self.config.refresh_ttl_secs,
        };
        let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);

        Claims {
            user_id: subject.user_id.clone(),
            username: subject.username.clone(),
            email: subject.email.clone(),
            roles: subject.roles.clone(),
            scope: subject.scope.clone(),
            issuer: self.config.issuer.clone(),
            audience: Audience::One(self.config.audience.clone()),
            issued_at,
            not_before: issued_at,
            expires_at: issued_at.saturating_add(ttl),
            token_id: Some(Uuid::now_v7().to_string()),
            token_type,
        }
    }

    /// Issues an access token.
    pub fn issue_access_token(&self, subject: &TokenSubject) -> Result<String, AuthError> {
        let claims = self.claims_for(subject, TokenType::Access, Utc::now().timestamp());
        self.sign(&claims)
    }

    /// Issues a fresh access/refresh pair sharing one `iat`.
    pub fn issue_token_pair(&self, subject: &TokenSubject) -> Result<TokenPair, AuthError> {
        let now = Utc::now().timestamp();
        let access = self.claims_for(subject, TokenType::Access, now);
        let refresh = self.claims_for(subject, TokenType::Refresh, now);

        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl_secs,
            issued_at: Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now),
        })
    }

    /// Validates a token of either type and returns its claims.
    ///
    /// Checks, in order: structure, `alg`, signature, `exp`, `nbf`, `iss`,
    /// `aud`, then `nbf <= iat <= exp` and a non-empty `uid`.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)?.claims;

        // NumericDate has second resolution; a token whose `exp` second has
        // started is already expired.
        let leeway_ms = i64::try_from(self.config.leeway_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        let expires_ms = claims.expires_at.saturating_mul(1000).saturating_add(leeway_ms);
        if expires_ms <= Utc::now().timestamp_millis() {
            return Err(AuthError::Expired);
        }
        if !claims.timestamps_consistent() {
            return Err(AuthError::InconsistentTimestamps);
        }
        if claims.user_id.is_empty() {
            return Err(AuthError::MissingClaim("uid".to_string()));
        }

        Ok(claims)
    }

    /// Validates an access token.
    pub fn validate_access(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.validate(token)?;
        if claims.token_type != TokenType::Access {
            return Err(AuthError::WrongTokenType { expected: "access" });
        }
        Ok(claims)
    }

    /// Exchanges a refresh token for a new pair with a fresh `iat`.
    ///
    /// The signing key is not rotated.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.validate(refresh_token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::WrongTokenType {
                expected: "refresh",
            });
        }
        tracing::debug!(user_id = %claims.user_id, "refreshing token pair");
        self.issue_token_pair(&claims.subject())
    }
}
