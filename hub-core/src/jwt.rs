//! Bearer-JWT verification for the HTTP surface.
//!
//! Minting is out of scope (owned by an external auth service); this module
//! only verifies tokens signed with the hub's configured HMAC-SHA-256
//! secret and exposes the claim shape the rest of the hub needs.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::HubError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub email: String,
    pub role: String,
    pub exp: i64,
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// `secret` must be at least 32 bytes when it was explicitly supplied by
    /// an operator; an auto-generated secret always satisfies this.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            encoding_key: EncodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, HubError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|_| HubError::Unauthorized)
    }

    /// Used only by tests and local tooling to mint tokens against the same
    /// secret the hub verifies with; production token issuance lives
    /// outside this crate.
    pub fn issue(&self, claims: &Claims) -> Result<String, HubError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| HubError::Internal(e.to_string()))
    }
}

/// Extracts a bearer token from an `Authorization` header value.
pub fn bearer_token(header_value: Option<&str>) -> Option<&str> {
    header_value?.strip_prefix("Bearer ").map(str::trim)
}
