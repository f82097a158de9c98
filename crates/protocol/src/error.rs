//! Protocol error types

use thiserror::Error;

/// Diagnostic side-channel errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Command tag with an unknown command or packet version
    #[error("Unknown diagnostic command tag {tag:#010x}")]
    UnknownCommand { tag: u32 },

    /// Device-info block failed validation
    #[error("Device info block is empty (version 0)")]
    EmptyDeviceInfo,

    /// I/O error while decoding
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
        let err = ProtocolError::BufferTooSmall {
            needed: 16,
            available: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Buffer too small"));
        assert!(msg.contains("16"));
        assert!(msg.contains("4"));
    }

    #[test]
    fn test_unknown_command_error() {
        let err = ProtocolError::UnknownCommand { tag: 0x0001_0007 };
        assert!(format!("{}", err).contains("0x00010007"));
    }
}
