//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Report could not be decoded into a packet
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Packets could not be reassembled into a message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Message payload exceeds the one-byte length field
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Device identity string could not be parsed
    #[error("Invalid device ID '{0}', expected VID:PID (e.g. '0x3434:0x0321')")]
    InvalidDeviceId(String),

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Incomplete frame data
    #[error("Incomplete frame: expected {expected} bytes, got {actual}")]
    IncompleteFrame { expected: usize, actual: usize },

    /// RPC payload (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MessageTooLarge {
            size: 300,
            max: 255,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Message too large"));
        assert!(msg.contains("300"));
        assert!(msg.contains("255"));
    }

    #[test]
    fn test_invalid_device_id_error() {
        let err = ProtocolError::InvalidDeviceId("nonsense".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("nonsense"));
        assert!(msg.contains("VID:PID"));
    }
}
