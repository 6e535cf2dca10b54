//! Core identifier and lifecycle types.
//!
//! These wrapper types provide the vocabulary the engine, the routing layer,
//! and the plugins use to talk about a connection without holding the
//! connection itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a connector within an engine instance.
///
/// A wrapper around UUID that provides type safety and ensures connector
/// ids cannot be confused with other kinds of ids in the system.
///
/// # Examples
///
/// ```rust
/// use tokamak_protocol::ConnectorId;
///
/// let id = ConnectorId::new();
/// println!("Connector: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectorId(pub Uuid);

impl ConnectorId {
    /// Creates a new random connector ID using UUID v4.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a connector.
///
/// Transitions are monotonic: `Connecting -> Up -> Down`. `Down` is
/// terminal; no transition out of it is ever observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    /// Socket accepted, handshake not yet complete
    Connecting,
    /// Handshake succeeded, packets flow
    Up,
    /// Connection closed and resources released (terminal)
    Down,
}

impl ConnectorStatus {
    /// Numeric encoding used by the atomic status cell.
    pub fn as_u8(self) -> u8 {
        match self {
            ConnectorStatus::Connecting => 0,
            ConnectorStatus::Up => 1,
            ConnectorStatus::Down => 2,
        }
    }

    /// Decodes the atomic status cell. Values above the range clamp to `Down`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectorStatus::Connecting,
            1 => ConnectorStatus::Up,
            _ => ConnectorStatus::Down,
        }
    }
}

/// Why a connector was closed.
///
/// Structured close reasons let the routing layer and plugins distinguish a
/// peer that hung up from a server-side teardown or a stalled write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The client disconnected or its read side failed
    Client,
    /// A server-side write failure forced the close
    Server,
    /// A configured timeout elapsed (handshake or send watchdog)
    Timeout,
    /// The server is shutting down
    Shutdown,
    /// The connection was over the accept cap and the policy was `reject`
    Reject,
    /// The connection was over the accept cap and the policy was `redirect`
    Redirect,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CloseReason::Client => "client",
            CloseReason::Server => "server",
            CloseReason::Timeout => "timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Reject => "reject",
            CloseReason::Redirect => "redirect",
        };
        write!(f, "{label}")
    }
}

/// The wire-protocol era negotiated during the handshake.
///
/// `Hixie` is the early `0x00 .. 0xFF` delimited framing; `Hybi` is the
/// modern opcode/mask/length framing. The version integer is the value of
/// the version header, defaulted when the client does not send one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Draft {
    /// Legacy delimiter-framed protocol
    Hixie,
    /// Modern opcode-framed protocol
    Hybi,
}

impl std::fmt::Display for Draft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Draft::Hixie => write!(f, "hixie"),
            Draft::Hybi => write!(f, "hybi"),
        }
    }
}
