//! Byte relay for one multiplexed TCP connection
//!
//! Both ends of a tunnel run the same discipline: bytes read from a socket go
//! out as `tcp:data` frames, frames addressed to the connection are written to
//! the socket, and exactly one side emits the terminating `tcp:close`.

pub mod pump;
pub mod state;

pub use pump::{ConnectionCommand, ConnectionHandle, BUFFER_SIZE, COMMAND_CAPACITY};
pub use state::{ConnectionError, ConnectionEvent, ConnectionState};
