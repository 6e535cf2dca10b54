//! Protocol-level error types.

use thiserror::Error;

/// Errors raised by framing, codecs, and storage providers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame violated the wire format (bad delimiter, reserved bits, a
    /// client frame without a mask, and so on)
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// A frame announced a payload larger than the configured limit
    #[error("Frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Announced payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// A codec could not encode or decode a token
    #[error("Codec error: {0}")]
    Codec(String),

    /// A decoded token carried no namespace; the routing layer rejects these
    #[error("Token has no namespace")]
    MissingNamespace,

    /// A storage provider failed
    #[error("Storage error: {0}")]
    Storage(String),
}
