//! Configuration settings structures
//!
//! This module defines all the configuration structures used by the server:
//! engine settings (listeners, timeouts, accept policy), token dispatch
//! settings, session settings, and logging options. Everything serializes
//! to and from TOML for configuration files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
///
/// This is the root configuration object that contains all server settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Connection engine settings
    pub engine: EngineSettings,
    /// Token dispatch pool settings
    pub dispatch: DispatchSettings,
    /// Session and reconnection settings
    pub session: SessionSettings,
    /// Optional logging configuration
    pub logging: Option<LoggingSettings>,
}

/// Which connection engine form to run.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// One dedicated reader task per connection
    Spawn,
    /// Shared dispatch queue drained by a worker pool
    Reactor,
}

/// Policy applied when a new connection arrives above the connection cap.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcceptPolicy {
    /// Hold the accept loop until capacity frees
    Wait,
    /// Accept then immediately close without a handshake
    Close,
    /// Complete the handshake, then close with a reject reason
    Reject,
    /// Complete the handshake, then close with a redirect reason
    Redirect,
}

/// TLS listener settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TlsSettings {
    /// Address for the encrypted listener (e.g. "0.0.0.0:9797")
    pub listen_addr: String,
    /// PEM certificate chain path
    pub cert_path: String,
    /// PEM private key path
    pub key_path: String,
}

/// Connection engine settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineSettings {
    /// Network address for the plain listener
    ///
    /// Format: "IP:PORT" (e.g. "127.0.0.1:8787" for localhost,
    /// "0.0.0.0:8787" for all interfaces)
    pub listen_addr: String,

    /// Optional encrypted listener
    pub tls: Option<TlsSettings>,

    /// Which engine form to run
    #[serde(default = "default_engine_kind")]
    pub kind: EngineKind,

    /// Maximum number of concurrent connectors
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// What to do with connections above the cap
    #[serde(default = "default_accept_policy")]
    pub accept_policy: AcceptPolicy,

    /// Maximum accepted frame payload in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// How long a client may take to present its handshake, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Watchdog budget for a single outbound write, in milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Allowed origin domains; `*` expands to a wildcard, empty admits all
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Worker task count for the reactor engine (0 means one per CPU core)
    #[serde(default)]
    pub reactor_workers: usize,
}

/// Token dispatch pool settings.
///
/// Tokens that request out-of-band execution run on a bounded pool instead
/// of the engine's dispatch task.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DispatchSettings {
    /// Maximum concurrently running pooled handlers
    #[serde(default = "default_pool_max_tasks")]
    pub max_tasks: usize,
    /// Maximum handlers waiting for a pool slot before new work is refused
    #[serde(default = "default_pool_max_queue")]
    pub max_queue: usize,
    /// Orderly-drain deadline on shutdown, in milliseconds
    #[serde(default = "default_pool_shutdown_ms")]
    pub shutdown_grace_ms: u64,
}

/// Session and reconnection settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionSettings {
    /// How long a disconnected session's storage survives, in milliseconds
    #[serde(default = "default_reconnection_timeout_ms")]
    pub reconnection_timeout_ms: u64,
    /// Expired-session sweep interval, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Logging system configuration
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingSettings {
    /// Logging level filter
    ///
    /// Valid values: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Enable JSON-formatted log output
    pub json_format: bool,
}

fn default_engine_kind() -> EngineKind {
    EngineKind::Spawn
}

fn default_max_connections() -> usize {
    10_000
}

fn default_accept_policy() -> AcceptPolicy {
    AcceptPolicy::Wait
}

fn default_max_frame_size() -> usize {
    1 << 20
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_pool_max_tasks() -> usize {
    32
}

fn default_pool_max_queue() -> usize {
    256
}

fn default_pool_shutdown_ms() -> u64 {
    5_000
}

fn default_reconnection_timeout_ms() -> u64 {
    60_000
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

impl EngineSettings {
    /// Handshake deadline as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Send watchdog budget as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Effective reactor worker count.
    pub fn effective_reactor_workers(&self) -> usize {
        if self.reactor_workers == 0 {
            num_cpus::get()
        } else {
            self.reactor_workers
        }
    }
}

impl Default for Config {
    /// Create a default configuration suitable for development.
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            dispatch: DispatchSettings::default(),
            session: SessionSettings::default(),
            logging: Some(LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            }),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
            tls: None,
            kind: default_engine_kind(),
            max_connections: default_max_connections(),
            accept_policy: default_accept_policy(),
            max_frame_size: default_max_frame_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            allowed_origins: Vec::new(),
            reactor_workers: 0,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_tasks: default_pool_max_tasks(),
            max_queue: default_pool_max_queue(),
            shutdown_grace_ms: default_pool_shutdown_ms(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnection_timeout_ms: default_reconnection_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.engine.listen_addr, "127.0.0.1:8787");
        assert_eq!(config.engine.max_connections, 10_000);
        assert_eq!(config.engine.accept_policy, AcceptPolicy::Wait);
        assert_eq!(config.engine.kind, EngineKind::Spawn);
        assert!(config.engine.tls.is_none());
        assert!(config.logging.is_some());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
[engine]
listen_addr = "0.0.0.0:8787"
kind = "reactor"
max_connections = 500
accept_policy = "reject"
max_frame_size = 65536
connect_timeout_ms = 2000
send_timeout_ms = 4000
allowed_origins = ["*.example.com"]
reactor_workers = 4

[dispatch]
max_tasks = 8
max_queue = 64
shutdown_grace_ms = 1000

[session]
reconnection_timeout_ms = 30000
sweep_interval_ms = 5000

[logging]
level = "debug"
json_format = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.kind, EngineKind::Reactor);
        assert_eq!(config.engine.accept_policy, AcceptPolicy::Reject);
        assert_eq!(config.engine.max_connections, 500);
        assert_eq!(config.engine.reactor_workers, 4);
        assert_eq!(config.dispatch.max_tasks, 8);
        assert_eq!(config.session.reconnection_timeout_ms, 30_000);
        assert!(config.logging.unwrap().json_format);
    }

    #[test]
    fn test_toml_defaults_fill_in() {
        let toml_str = r#"
[engine]
listen_addr = "127.0.0.1:9000"

[dispatch]

[session]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.max_connections, 10_000);
        assert_eq!(config.engine.accept_policy, AcceptPolicy::Wait);
        assert_eq!(config.dispatch.max_tasks, 32);
        assert_eq!(config.session.sweep_interval_ms, 10_000);
    }

    #[test]
    fn test_effective_reactor_workers() {
        let mut engine = EngineSettings::default();
        assert!(engine.effective_reactor_workers() >= 1);
        engine.reactor_workers = 3;
        assert_eq!(engine.effective_reactor_workers(), 3);
    }
}
