//! Credential verification.
//!
//! Tokens are opaque bearer credentials minted by an external service;
//! the relay only verifies them and extracts the user identity.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parley_protocol::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
}

/// Verification errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Signature, structure, or expiry check failed.
    #[error("Invalid or expired token")]
    InvalidToken(#[source] jsonwebtoken::errors::Error),

    /// Token verified but its subject is not a user ID.
    #[error("Token subject is not a user id")]
    BadSubject(#[source] uuid::Error),
}

/// Seam for credential verification, so tests can substitute their own
/// issuer.
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token and extract the user identity.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid, expired, or malformed credentials.
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// HS256 JWT verifier.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for the given shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(AuthError::InvalidToken)?;
        data.claims.sub.parse().map_err(AuthError::BadSubject)
    }
}

#[cfg(test)]
pub(crate) fn mint_token(secret: &str, user: UserId, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user.to_string(),
        iat: now,
        exp: now + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding")
}
