//! Configuration management for the Tokamak server.
//!
//! Loads the TOML configuration file (creating a default one on first run)
//! and applies command-line overrides on top.

use anyhow::{Context, Result};
use std::path::Path;
use token_server::{Config, EngineKind};
use tracing::info;

use crate::cli::CliArgs;

/// Loads the configuration file, creating a default one if it is missing.
pub async fn load(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("Bad TOML in {}", path.display()))?;
        Ok(config)
    } else {
        let default_config = Config::default();
        let toml_content = toml::to_string_pretty(&default_config)?;
        tokio::fs::write(path, toml_content)
            .await
            .with_context(|| format!("Cannot write {}", path.display()))?;
        info!("Created default configuration file: {}", path.display());
        Ok(default_config)
    }
}

/// Applies command-line overrides to a loaded configuration.
pub fn apply_overrides(mut config: Config, args: &CliArgs) -> Result<Config> {
    if let Some(listen) = &args.listen_addr {
        config.engine.listen_addr = listen.clone();
    }
    if let Some(engine) = &args.engine {
        config.engine.kind = match engine.as_str() {
            "spawn" => EngineKind::Spawn,
            "reactor" => EngineKind::Reactor,
            other => anyhow::bail!("Unknown engine kind: {other}"),
        };
    }
    if let Some(level) = &args.log_level {
        if let Some(logging) = &mut config.logging {
            logging.level = level.clone();
        }
    }
    if args.json_logs {
        if let Some(logging) = &mut config.logging {
            logging.json_format = true;
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args() -> CliArgs {
        CliArgs {
            config_path: PathBuf::from("config.toml"),
            listen_addr: None,
            engine: None,
            log_level: None,
            json_logs: false,
        }
    }

    #[test]
    fn test_overrides_apply() {
        let mut cli = args();
        cli.listen_addr = Some("0.0.0.0:9999".to_string());
        cli.engine = Some("reactor".to_string());
        cli.json_logs = true;

        let config = apply_overrides(Config::default(), &cli).unwrap();
        assert_eq!(config.engine.listen_addr, "0.0.0.0:9999");
        assert_eq!(config.engine.kind, EngineKind::Reactor);
        assert!(config.logging.unwrap().json_format);
    }

    #[test]
    fn test_unknown_engine_kind_rejected() {
        let mut cli = args();
        cli.engine = Some("threads".to_string());
        assert!(apply_overrides(Config::default(), &cli).is_err());
    }
}
