//! Allow-list registration tokens
//!
//! An agent proves it owns a lease by signing `{ip, port}` with the secret the
//! relay returned in `exposed`. The relay cannot pick the verification key
//! before it knows the port, so the port is first read from the token without
//! checking the signature ([`AllowListToken::peek_port`]), then the whole token
//! is verified against that lease's secret ([`AllowListToken::verify`]).

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllowListTokenError {
    #[error("Invalid token: {0}")]
    Malformed(String),

    #[error("Port is required")]
    MissingPort,

    #[error("IP is required")]
    MissingIp,

    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("Signature verification failed: {0}")]
    SignatureRejected(jsonwebtoken::errors::Error),

    #[error("Token encoding failed: {0}")]
    Encoding(jsonwebtoken::errors::Error),
}

/// Verified contents of an allow-list token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowListClaims {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Serialize)]
struct SignedClaims<'a> {
    ip: &'a str,
    port: u16,
}

#[derive(Deserialize)]
struct RawClaims {
    ip: Option<Value>,
    port: Option<Value>,
}

pub struct AllowListToken;

impl AllowListToken {
    /// Sign `{ip, port}` with a lease secret
    pub fn sign(secret: &str, ip: &str, port: u16) -> Result<String, AllowListTokenError> {
        let claims = SignedClaims { ip, port };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(AllowListTokenError::Encoding)
    }

    /// Read the claimed port without verifying the signature.
    ///
    /// The result only selects which lease secret to verify against; it must
    /// never be trusted on its own.
    pub fn peek_port(token: &str) -> Result<u16, AllowListTokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;

        let data = decode::<RawClaims>(token.trim(), &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| AllowListTokenError::Malformed(e.to_string()))?;

        parse_port(data.claims.port.as_ref())
    }

    /// Verify the token against `secret` and return its claims
    pub fn verify(token: &str, secret: &str) -> Result<AllowListClaims, AllowListTokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_aud = false;

        let data = decode::<RawClaims>(
            token.trim(),
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(AllowListTokenError::SignatureRejected)?;

        let ip = match data.claims.ip {
            Some(Value::String(ip)) if !ip.is_empty() => ip,
            Some(Value::String(_)) | Some(Value::Null) | None => {
                return Err(AllowListTokenError::MissingIp)
            }
            Some(other) => return Err(AllowListTokenError::InvalidIp(other.to_string())),
        };
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| AllowListTokenError::InvalidIp(ip.clone()))?;
        let port = parse_port(data.claims.port.as_ref())?;

        Ok(AllowListClaims { ip, port })
    }
}

/// Ports arrive as numbers, or as decimal strings from agents that cut them out of the lease URL
fn parse_port(value: Option<&Value>) -> Result<u16, AllowListTokenError> {
    let port = match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    };

    match port {
        Some(0) | None => Err(AllowListTokenError::MissingPort),
        Some(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign_raw(secret: &str, claims: &Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_sign_and_verify() {
        let token = AllowListToken::sign("lease-secret", "1.2.3.4", 4456).unwrap();
        let claims = AllowListToken::verify(&token, "lease-secret").unwrap();

        assert_eq!(claims.ip, "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(claims.port, 4456);
    }

    #[test]
    fn test_peek_port_ignores_signature() {
        let token = AllowListToken::sign("whatever", "1.2.3.4", 5000).unwrap();
        assert_eq!(AllowListToken::peek_port(&token).unwrap(), 5000);
    }

    #[test]
    fn test_peek_port_accepts_string_port() {
        let token = sign_raw("s", &json!({ "ip": "::1", "port": "4460" }));
        assert_eq!(AllowListToken::peek_port(&token).unwrap(), 4460);
    }

    #[test]
    fn test_peek_port_missing() {
        let token = sign_raw("s", &json!({ "ip": "::1" }));
        assert!(matches!(
            AllowListToken::peek_port(&token),
            Err(AllowListTokenError::MissingPort)
        ));

        let token = sign_raw("s", &json!({ "ip": "::1", "port": 0 }));
        assert!(matches!(
            AllowListToken::peek_port(&token),
            Err(AllowListTokenError::MissingPort)
        ));
    }

    #[test]
    fn test_peek_port_malformed() {
        assert!(matches!(
            AllowListToken::peek_port("definitely not a token"),
            Err(AllowListTokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_verify_wrong_secret() {
        let token = AllowListToken::sign("right", "1.2.3.4", 4456).unwrap();
        assert!(matches!(
            AllowListToken::verify(&token, "wrong"),
            Err(AllowListTokenError::SignatureRejected(_))
        ));
    }

    #[test]
    fn test_verify_missing_ip() {
        let token = sign_raw("s", &json!({ "port": 4456 }));
        assert!(matches!(
            AllowListToken::verify(&token, "s"),
            Err(AllowListTokenError::MissingIp)
        ));
    }

    #[test]
    fn test_verify_invalid_ip() {
        let token = sign_raw("s", &json!({ "ip": "not-an-ip", "port": 4456 }));
        assert!(matches!(
            AllowListToken::verify(&token, "s"),
            Err(AllowListTokenError::InvalidIp(_))
        ));
    }

    #[test]
    fn test_verify_mapped_ipv6() {
        let token = sign_raw("s", &json!({ "ip": "::ffff:127.0.0.1", "port": 4456 }));
        let claims = AllowListToken::verify(&token, "s").unwrap();
        assert_eq!(claims.ip.to_canonical(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
