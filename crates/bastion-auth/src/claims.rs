//! Token claims.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Distinguishes access tokens from refresh tokens.
///
/// Serialized as the private `typ` claim. Tokens without the claim are
/// treated as access tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived token presented on every request.
    #[default]
    Access,
    /// Long-lived token exchanged for a new pair.
    Refresh,
}

impl TokenType {
    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

/// The `aud` claim, which may be a single string or an array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// A single audience.
    One(String),
    /// Several audiences.
    Many(Vec<String>),
}

impl Audience {
    /// Returns `true` if `audience` is one of the token's audiences.
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Self::One(aud) => aud == audience,
            Self::Many(auds) => auds.iter().any(|a| a == audience),
        }
    }
}

/// Identity fields a token is issued for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenSubject {
    /// User identifier, written as `uid`.
    pub user_id: String,
    /// Display name.
    pub username: Option<String>,
    /// Email address.
    pub email: Option<String>,
    /// Role identifiers.
    pub roles: BTreeSet<String>,
    /// OAuth-style scopes.
    pub scope: Option<BTreeSet<String>>,
}

impl TokenSubject {
    /// Creates a subject with only a user id.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Sets the username.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Adds a scope entry.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope
            .get_or_insert_with(BTreeSet::new)
            .insert(scope.into());
        self
    }
}

/// The full claim set of a Bastion token.
///
/// Timestamps are NumericDate seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User identifier.
    #[serde(rename = "uid")]
    pub user_id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Email address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Role identifiers.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// OAuth-style scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<BTreeSet<String>>,
    /// Issuer (`iss`).
    #[serde(rename = "iss")]
    pub issuer: String,
    /// Audience (`aud`).
    #[serde(rename = "aud")]
    pub audience: Audience,
    /// Issued at (`iat`).
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Not before (`nbf`).
    #[serde(rename = "nbf")]
    pub not_before: i64,
    /// Expiration (`exp`).
    #[serde(rename = "exp")]
    pub expires_at: i64,
    /// Unique token identifier (`jti`).
    #[serde(rename = "jti", default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Access or refresh.
    #[serde(rename = "typ", default)]
    pub token_type: TokenType,
}

impl Claims {
    /// Returns the identity portion of the claims.
    #[must_use]
    pub fn subject(&self) -> TokenSubject {
        TokenSubject {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            scope: self.scope.clone(),
        }
    }

    /// Returns `true` if `nbf <= iat <= exp`.
    #[must_use]
    pub const fn timestamps_consistent(&self) -> bool {
        self.not_before <= self.issued_at && self.issued_at <= self.expires_at
    }

    /// Returns `true` if the token carries `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Returns `true` if the token's scope contains `scope`.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.as_ref().is_some_and(|s| s.contains(scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Claims {
        Claims {
            user_id: "u-1".to_string(),
            username: Some("alice".to_string()),
            email: None,
            roles: ["admin".to_string()].into_iter().collect(),
            scope: None,
            issuer: "bastion".to_string(),
            audience: Audience::One("api".to_string()),
            issued_at: 100,
            not_before: 100,
            expires_at: 200,
            token_id: None,
            token_type: TokenType::Access,
        }
    }

    #[test]
    fn test_wire_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["uid"], "u-1");
        assert_eq!(value["iss"], "bastion");
        assert_eq!(value["aud"], "api");
        assert_eq!(value["iat"], 100);
        assert_eq!(value["nbf"], 100);
        assert_eq!(value["exp"], 200);
        assert_eq!(value["typ"], "access");
        assert!(value.get("email").is_none());
        assert!(value.get("user_id").is_none());
    }

    #[test]
    fn test_audience_array() {
        let claims: Claims = serde_json::from_value(json!({
            "uid": "u-2",
            "iss": "bastion",
            "aud": ["web", "api"],
            "iat": 1, "nbf": 1, "exp": 2
        }))
        .unwrap();
        assert!(claims.audience.contains("api"));
        assert!(!claims.audience.contains("mobile"));
        assert!(claims.roles.is_empty());
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn test_timestamp_invariant() {
        let mut claims = sample();
        assert!(claims.timestamps_consistent());
        claims.not_before = 150;
        assert!(!claims.timestamps_consistent());
    }

    #[test]
    fn test_scope_lookup() {
        let subject = TokenSubject::new("u").with_scope("read:users");
        let mut claims = sample();
        claims.scope = subject.scope;
        assert!(claims.has_scope("read:users"));
        assert!(!claims.has_scope("write:users"));
        assert!(claims.has_role("admin"));
    }
}
