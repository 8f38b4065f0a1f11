//! Relay control protocol
//!
//! Message types exchanged between the relay and an agent over the control
//! channel, and the frame codec that puts them on the wire.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, CodecError};
pub use messages::*;

/// Protocol version announced by agents during the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded size of a single control frame (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
