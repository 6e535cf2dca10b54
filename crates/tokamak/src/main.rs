//! Main application entry point for the Tokamak token server.
//!
//! Wires the pieces together: configuration, logging, the storage-backed
//! session manager, the token server with its built-in plugins, and one of
//! the two engine forms, then runs until a termination signal arrives.

mod cli;
mod config;
mod signals;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tokamak_protocol::MemoryStorage;
use token_server::{
    Config, ConnectorRegistry, EngineHooks, EngineKind, LoggingSettings, ReactorEngine,
    RrpcManager, SessionManager, SpawnEngine, TokenServer,
};

use cli::CliArgs;

/// Initialize the logging system.
fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    if settings.json_format {
        registry
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
    Ok(())
}

/// The two engine forms behind one start/stop surface.
enum Engine {
    Spawn(SpawnEngine),
    Reactor(ReactorEngine),
}

impl Engine {
    async fn start(&self) -> Result<(), token_server::ServerError> {
        match self {
            Engine::Spawn(engine) => engine.start().await,
            Engine::Reactor(engine) => engine.start().await,
        }
    }

    fn shutdown(&self) {
        match self {
            Engine::Spawn(engine) => engine.shutdown(),
            Engine::Reactor(engine) => engine.shutdown(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let loaded = config::load(&args.config_path).await?;
    let config: Config = config::apply_overrides(loaded, &args)?;

    let logging = config.logging.clone().unwrap_or(LoggingSettings {
        level: "info".to_string(),
        json_format: args.json_logs,
    });
    setup_logging(&logging)?;

    info!("🚀 Starting Tokamak token server");
    info!("   Listen address: {}", config.engine.listen_addr);
    info!("   Engine: {:?}", config.engine.kind);

    // Storage and sessions. The in-memory provider is the default; a
    // persistent provider plugs in through the same trait.
    let storage = Arc::new(MemoryStorage::new());
    let sessions = SessionManager::new(
        storage,
        Duration::from_millis(config.session.reconnection_timeout_ms),
    );
    let sweep = sessions
        .clone()
        .start_sweep(Duration::from_millis(config.session.sweep_interval_ms));

    // Routing layer with the built-in reverse-RPC plugin.
    let registry = Arc::new(ConnectorRegistry::new());
    let server = TokenServer::new(registry.clone(), &config.dispatch, Some(sessions));
    let rrpc = RrpcManager::new();
    server.add_plugin(rrpc);

    let hooks: Arc<dyn EngineHooks> = server.clone();
    let engine = Arc::new(match config.engine.kind {
        EngineKind::Spawn => Engine::Spawn(SpawnEngine::new(
            config.engine.clone(),
            registry,
            hooks,
        )),
        EngineKind::Reactor => Engine::Reactor(ReactorEngine::new(
            config.engine.clone(),
            registry,
            hooks,
        )),
    });

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.start().await {
                error!("💥 Engine failed: {e}");
            }
        })
    };

    signals::setup_signal_handlers()
        .await
        .map_err(|e| anyhow::anyhow!("signal handler setup failed: {e}"))?;

    info!("🛑 Shutting down...");
    engine.shutdown();
    let _ = runner.await;
    server.shutdown().await;
    sweep.abort();
    info!("✅ Shutdown complete");
    Ok(())
}
