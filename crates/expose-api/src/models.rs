//! API request and response models

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Port currently bound to an alias
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct AliasLookup {
    /// Public port on the relay
    pub port: u16,
    pub alias: String,
}

/// Query parameters for the control-channel upgrade
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelQuery {
    /// Handshake bearer token
    pub token: Option<String>,
    /// Control protocol version spoken by the agent
    pub version: Option<u32>,
}
