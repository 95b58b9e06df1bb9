//! # Bastion Auth
//!
//! Identity and policy for the Bastion request-governance stack.
//!
//! - [`JwtVerifier`] - Issues and validates compact JWS tokens signed with a
//!   single algorithm family (HMAC or RSA), including refresh-token rotation
//! - [`Claims`] - The claim set carried by access and refresh tokens
//! - [`RbacStore`] - A process-wide role/permission registry with role
//!   inheritance, wildcard permissions and cycle detection
//!
//! ## Example
//!
//! ```
//! use bastion_auth::{JwtConfig, JwtKey, JwtVerifier, RbacStore, TokenSubject};
//!
//! let verifier = JwtVerifier::new(
//!     JwtConfig::default(),
//!     JwtKey::hmac("a-very-long-shared-secret-for-doc-tests"),
//! )
//! .unwrap();
//!
//! let token = verifier
//!     .issue_access_token(&TokenSubject::new("u-42").with_role("user"))
//!     .unwrap();
//! let claims = verifier.validate_access(&token).unwrap();
//!
//! let rbac = RbacStore::with_default_policy();
//! assert!(rbac.check_permission(&claims.roles, "user", "read").unwrap());
//! assert!(!rbac.check_permission(&claims.roles, "user", "delete").unwrap());
//! ```

#![doc(html_root_url = "https://docs.rs/bastion-auth/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod claims;
mod error;
mod jwt;
pub mod rbac;

pub use claims::{Audience, Claims, TokenSubject, TokenType};
pub use error::AuthError;
pub use jwt::{JwtAlgorithm, JwtConfig, JwtKey, JwtVerifier, TokenPair};
pub use rbac::{has_all_roles, has_any_role, Permission, RbacError, RbacStore, Role};
