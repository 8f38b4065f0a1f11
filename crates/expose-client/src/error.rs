use expose_auth::AllowListTokenError;
use expose_proto::CodecError;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Control channel error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Relay rejected expose of port {port}: {reason}")]
    ExposeRejected { port: u16, reason: String },

    #[error("Allow-list token error: {0}")]
    AllowListToken(#[from] AllowListTokenError),

    #[error("Allow-list registration failed: {0}")]
    AllowList(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control channel closed by relay")]
    Disconnected,
}

impl AgentError {
    /// Whether the agent had a working control channel before this error
    pub fn was_connected(&self) -> bool {
        matches!(self, AgentError::Disconnected)
    }

    /// Whether reconnecting with the same configuration cannot succeed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::ExposeRejected { .. } | AgentError::InvalidUrl(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_expose_is_fatal() {
        let rejected = AgentError::ExposeRejected {
            port: 4455,
            reason: "No available ports in range 4456-4456".to_string(),
        };
        assert!(rejected.is_fatal());
        assert!(!rejected.was_connected());
    }

    #[test]
    fn test_lost_channel_is_retried() {
        assert!(!AgentError::Disconnected.is_fatal());
        assert!(AgentError::Disconnected.was_connected());
        assert!(!AgentError::Protocol("unexpected text frame".to_string()).is_fatal());
    }
}
