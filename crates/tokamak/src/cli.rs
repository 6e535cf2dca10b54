//! Command-line interface handling for the Tokamak server.
//!
//! This module provides command-line argument parsing using the `clap`
//! crate so runtime parameters can override configuration file settings.

use clap::{Arg, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
///
/// Holds the options that can override configuration file settings or
/// provide runtime parameters.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the plain listen address
    pub listen_addr: Option<String>,
    /// Optional override for the engine form ("spawn" or "reactor")
    pub engine: Option<String>,
    /// Optional override for the log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses command line arguments using clap.
    pub fn parse() -> Self {
        let matches = Command::new("Tokamak Token Server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("WebSocket token server with plugin routing and reverse RPC")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("listen")
                    .short('b')
                    .long("listen")
                    .value_name("ADDRESS")
                    .help("Listen address (e.g., 127.0.0.1:8787)"),
            )
            .arg(
                Arg::new("engine")
                    .short('e')
                    .long("engine")
                    .value_name("KIND")
                    .help("Engine form: spawn or reactor"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .expect("Default config path should always be set"),
            ),
            listen_addr: matches.get_one::<String>("listen").cloned(),
            engine: matches.get_one::<String>("engine").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
