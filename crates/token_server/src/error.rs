//! Server error types.
//!
//! Connector-local I/O errors never surface here: the engine converts them
//! into disconnect events so one misbehaving connection cannot affect
//! others. What remains are failures a caller can act on.

use thiserror::Error;
use tokamak_protocol::{ConnectorId, ProtocolError};

use crate::engine::handshake::HandshakeError;

/// Errors surfaced by the engine and the routing layer.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener setup or socket-level failures
    #[error("Network error: {0}")]
    Network(String),

    /// A framing or codec violation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The handshake was rejected
    #[error("Handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    /// A send targeted a connector that is not up
    #[error("Connector {0} is not up")]
    ConnectorDown(ConnectorId),

    /// A send targeted an id the registry does not know
    #[error("Unknown connector {0}")]
    UnknownConnector(ConnectorId),

    /// Catch-all for internal failures
    #[error("Internal error: {0}")]
    Internal(String),
}
