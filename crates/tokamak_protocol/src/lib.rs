//! # Tokamak Protocol
//!
//! Protocol-level building blocks shared by the Tokamak server and by
//! embedders: the [`Token`] message model, framed [`Packet`]s, pluggable
//! wire codecs, and the storage provider interface used for sessions and
//! caching.
//!
//! ## Key Types
//!
//! - [`Token`] - A structured, namespaced application message
//! - [`Packet`] - An opaque framed payload with its [`FrameType`]
//! - [`TokenCodec`] - The `encode(Token) -> bytes` / `decode(bytes) -> Token`
//!   pair bound to a negotiated sub-protocol format
//! - [`StorageProvider`] - Key/value storage with optional per-entry TTL
//! - [`ConnectorId`] / [`ConnectorStatus`] / [`CloseReason`] - Connection
//!   lifecycle vocabulary
//!
//! ## Design Principles
//!
//! - **Type Safety**: Wrapper types prevent ID confusion across subsystems
//! - **Serialization**: Tokens keep field insertion order and survive a
//!   codec round-trip unchanged in namespace, type, and field set
//! - **Pluggability**: Codecs and storage backends are trait objects; the
//!   JSON codec and the in-memory store ship here, everything else is an
//!   external collaborator

pub use codec::{JsonTokenCodec, TokenCodec, FORMAT_JSON};
pub use error::ProtocolError;
pub use packet::{FrameType, Packet};
pub use storage::{MemoryStorage, StorageProvider};
pub use token::Token;
pub use types::{CloseReason, ConnectorId, ConnectorStatus, Draft};

pub mod codec;
pub mod error;
pub mod packet;
pub mod storage;
pub mod token;
pub mod types;
