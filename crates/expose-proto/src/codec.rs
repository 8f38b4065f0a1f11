//! Frame codec for the control channel
//!
//! One control frame carries exactly one bincode-encoded [`RelayMessage`].

use thiserror::Error;

use crate::messages::RelayMessage;
use crate::MAX_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Encode a message into a single frame payload
pub fn encode(message: &RelayMessage) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a single frame payload
pub fn decode(frame: &[u8]) -> Result<RelayMessage, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bincode::deserialize(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ConnectionId;

    #[test]
    fn test_expose_frame() {
        let msg = RelayMessage::Expose {
            port: 4455,
            secret: Some("shared".to_string()),
            alias: None,
        };
        let frame = encode(&msg).unwrap();
        assert_eq!(decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(matches!(decode(&[]), Err(CodecError::EmptyFrame)));
    }

    #[test]
    fn test_garbage_frame_rejected() {
        // Variant index far outside the enum
        let frame = [0xff, 0xff, 0xff, 0xff, 0x01];
        assert!(matches!(
            decode(&frame),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let msg = RelayMessage::TcpData {
            id: ConnectionId(1),
            data: vec![0u8; MAX_FRAME_SIZE + 1],
        };
        assert!(matches!(
            encode(&msg),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }
}
