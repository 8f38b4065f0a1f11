//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one multiplexed public connection within a session.
///
/// Identifiers are minted by the relay from a per-session counter, so the same
/// value can appear in two different sessions without ambiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages carried over the control channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RelayMessage {
    /// Agent asks for a public port mirroring its local `port`
    Expose {
        port: u16,
        secret: Option<String>,
        alias: Option<String>,
    },
    /// Lease granted. `port` echoes the agent's local port, `url` carries the leased one.
    Exposed {
        port: u16,
        url: String,
        secret: String,
        alias: String,
    },
    /// Lease could not be granted; the control channel stays open
    ExposeRejected {
        port: u16,
        reason: String,
    },

    /// A public socket was accepted and admitted by the allow-list
    TcpConnection {
        id: ConnectionId,
    },
    TcpData {
        id: ConnectionId,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    TcpClose {
        id: ConnectionId,
    },
}

impl RelayMessage {
    /// Event name used in logs
    pub fn event_name(&self) -> &'static str {
        match self {
            RelayMessage::Expose { .. } => "expose",
            RelayMessage::Exposed { .. } => "exposed",
            RelayMessage::ExposeRejected { .. } => "expose:rejected",
            RelayMessage::TcpConnection { .. } => "tcp:connection",
            RelayMessage::TcpData { .. } => "tcp:data",
            RelayMessage::TcpClose { .. } => "tcp:close",
        }
    }
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
