//! Connection lifecycle state machine

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Identifier announced, socket not yet streaming (agent side: still dialing)
    Admitted,
    /// Bytes flow in both directions
    Streaming,
    /// One side observed the close; no further frames for this id
    Closing,
    /// Socket released
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Socket is ready to stream
    Started,
    /// Local socket reached EOF
    LocalClosed,
    /// Local socket failed (dial, read or write error)
    LocalFailed,
    /// Peer sent `tcp:close`, or the control channel went away
    RemoteClosed,
    /// Socket has been shut down and dropped
    Finished,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid connection transition: {event:?} while {from}")]
    InvalidTransition {
        from: ConnectionState,
        event: ConnectionEvent,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Admitted => "admitted",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl ConnectionState {
    /// Apply an event.
    ///
    /// Returns the next state and whether this side must emit `tcp:close`.
    /// Only the first close observed by either side produces a frame.
    pub fn on(self, event: ConnectionEvent) -> Result<(ConnectionState, bool), ConnectionError> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Admitted, Started) => Ok((Streaming, false)),
            (Admitted | Streaming, LocalClosed | LocalFailed) => Ok((Closing, true)),
            (Admitted | Streaming, RemoteClosed) => Ok((Closing, false)),
            (Closing, Finished) => Ok((Closed, false)),
            (Closing, LocalClosed | LocalFailed | RemoteClosed) => Ok((Closing, false)),
            (Closed, _) => Ok((Closed, false)),
            (from, event) => Err(ConnectionError::InvalidTransition { from, event }),
        }
    }
}
