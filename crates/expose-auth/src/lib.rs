//! Authentication for the relay
//!
//! Two kinds of HS256 tokens are handled here:
//! - handshake tokens presented by agents when opening the control channel
//! - allow-list tokens an agent signs with its lease secret to admit a source IP

pub mod allowlist;
pub mod jwt;

pub use allowlist::{AllowListClaims, AllowListToken, AllowListTokenError};
pub use jwt::{generate_token, JwtClaims, JwtError, JwtValidator};
