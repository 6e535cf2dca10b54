//! # Token Server - WebSocket Application Server Core
//!
//! A WebSocket application server that terminates plain and TLS TCP,
//! performs the handshake across two protocol eras, and routes structured
//! token messages through ordered filter and plugin chains, with a
//! reverse-RPC facility for server-initiated calls to clients.
//!
//! ## Architecture Overview
//!
//! * **Connector** - per-connection state machine: handshake, framing,
//!   queued single-writer sends, monotonic `Connecting -> Up -> Down`
//!   lifecycle
//! * **Engine** - owns the listeners and the connector registry, fires
//!   lifecycle events; ships in a task-per-connection form and a
//!   reactor/worker-pool form behind the same contract
//! * **Token server** - decodes packets via the negotiated codec, runs the
//!   filter chain then the plugin chain, handles direct send, broadcast
//!   (one encode per wire format), and fragment reassembly
//! * **RRPC manager** - tagged reverse calls with wrap-around ids, per-call
//!   timeouts, and exactly-once resolution
//! * **Session manager** - durable session storage with a bounded
//!   reconnection window and a periodic expiry sweep
//!
//! ## Message Flow
//!
//! 1. Bytes arrive and the connector unframes them into packets
//! 2. The engine dispatches packets to the token server
//! 3. The codec bound to the connector's negotiated format decodes a token
//! 4. Filters may reject; plugins act on their namespace in order
//! 5. Replies and broadcasts encode once per format and queue per connector
//!
//! ## Error Handling
//!
//! Connector-local I/O failures convert to disconnect events with a
//! structured [`CloseReason`](tokamak_protocol::CloseReason); one
//! misbehaving connection never affects others. Plugin failures are caught
//! per plugin and logged. RRPC failures always reach the caller's callback.

pub use config::{
    AcceptPolicy, Config, DispatchSettings, EngineKind, EngineSettings, LoggingSettings,
    SessionSettings, TlsSettings,
};
pub use engine::connector::{Connector, VarBag};
pub use engine::reactor::ReactorEngine;
pub use engine::spawn::SpawnEngine;
pub use engine::{ConnectorRegistry, EngineHooks};
pub use error::ServerError;
pub use routing::{
    BroadcastOptions, FilterVerdict, PluginVerdict, TokenFilter, TokenPlugin, TokenServer,
};
pub use rrpc::{ProcedureCall, RrpcCallback, RrpcFailure, RrpcManager, RrpcOutcome};
pub use session::{SessionManager, SessionStorage};

pub mod config;
pub mod engine;
pub mod error;
pub mod routing;
pub mod rrpc;
pub mod session;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testutil;
