//! Framed packet representation.
//!
//! A [`Packet`] is what the engine hands to the routing layer after
//! unframing and what it frames back onto the wire on the way out. It is
//! ephemeral: one packet per I/O event, destroyed after dispatch.

use serde::{Deserialize, Serialize};

/// The frame type carried alongside a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// UTF-8 text payload
    Text,
    /// Opaque binary payload
    Binary,
    /// Keep-alive probe; the server answers with a Pong carrying the same payload
    Ping,
    /// Keep-alive answer
    Pong,
    /// Close handshake frame
    Close,
    /// Continuation of a fragmented message
    Fragment,
    /// Unrecognized opcode; the frame is discarded
    Invalid,
}

/// An opaque payload plus its frame type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// How the payload was (or will be) framed on the wire
    pub frame_type: FrameType,
    /// The raw payload bytes
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates a packet with an explicit frame type.
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Creates a text packet from a string.
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Text,
            payload: payload.into().into_bytes(),
        }
    }

    /// Creates a binary packet.
    pub fn binary(payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Binary,
            payload,
        }
    }

    /// Returns the payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Whether this is a control frame (ping, pong, or close).
    pub fn is_control(&self) -> bool {
        matches!(
            self.frame_type,
            FrameType::Ping | FrameType::Pong | FrameType::Close
        )
    }
}
