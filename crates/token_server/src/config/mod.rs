//! Server configuration.
//!
//! Settings structures for the engine, the routing layer, and the session
//! manager. The binary crate loads these from a TOML file and applies
//! command-line overrides.

pub mod settings;

pub use settings::{
    AcceptPolicy, Config, DispatchSettings, EngineKind, EngineSettings, LoggingSettings,
    SessionSettings, TlsSettings,
};
