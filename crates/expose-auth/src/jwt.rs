//! JWT (JSON Web Token) handling for the control-channel handshake

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JWT claims presented by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JwtClaims {
    /// Subject (authenticated principal)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Audience
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl JwtClaims {
    pub fn new(subject: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: None,
            aud: None,
        }
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),
}

/// Verifies handshake tokens against the relay's shared key
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a new JWT validator using HMAC-SHA256 (symmetric secret)
    ///
    /// Validates the signature and expiration only.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<JwtClaims, JwtError> {
        let token_data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation)?;
        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &JwtClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

/// Issue a handshake token for `subject`, valid for `hours_valid` hours
pub fn generate_token(subject: &str, secret: &[u8], hours_valid: i64) -> Result<String, JwtError> {
    let claims = JwtClaims::new(subject.to_string(), Duration::hours(hours_valid));
    JwtValidator::encode(secret, &claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    #[test]
    fn test_jwt_encode_decode() {
        let claims = JwtClaims::new("1".to_string(), Duration::hours(1));

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET);
        let decoded_claims = validator.validate(&token).unwrap();

        assert_eq!(decoded_claims, claims);
    }

    #[test]
    fn test_expired_token() {
        let claims = JwtClaims::new("1".to_string(), Duration::hours(-2));
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();
        let validator = JwtValidator::new(TEST_SECRET);

        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = generate_token("agent", b"one-secret", 1).unwrap();
        let validator = JwtValidator::new(b"another-secret");

        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let validator = JwtValidator::new(TEST_SECRET);
        assert!(validator.validate("not-a-jwt").is_err());
    }
}
