//! Task-per-connection engine.
//!
//! Every accepted connection gets a dedicated reader task that blocks on
//! socket reads and decodes inline; outgoing sends run through the
//! connector's single writer under the send watchdog. A stalled peer costs
//! one task and is reaped by the watchdog, never affecting its neighbors.

use futures::stream::{FuturesUnordered, StreamExt as FuturesStreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use tokamak_protocol::CloseReason;

use crate::config::{AcceptPolicy, EngineSettings};
use crate::engine::{
    self, apply_accept_policy, build_listener, drain_decoder, establish, finish, stop_all,
    tls, AcceptDecision, ConnectorRegistry, EngineHooks, PacketAction,
};
use crate::error::ServerError;

/// The engine form that dedicates a reader task to every connection.
pub struct SpawnEngine {
    settings: EngineSettings,
    registry: Arc<ConnectorRegistry>,
    hooks: Arc<dyn EngineHooks>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
}

impl SpawnEngine {
    /// Creates the engine. Nothing binds until [`SpawnEngine::start`].
    pub fn new(
        settings: EngineSettings,
        registry: Arc<ConnectorRegistry>,
        hooks: Arc<dyn EngineHooks>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            settings,
            registry,
            hooks,
            shutdown_tx,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The connector registry this engine owns.
    pub fn registry(&self) -> Arc<ConnectorRegistry> {
        self.registry.clone()
    }

    /// Binds the listeners and accepts until shutdown.
    pub async fn start(&self) -> Result<(), ServerError> {
        let addr: SocketAddr = self
            .settings
            .listen_addr
            .parse()
            .map_err(|e| ServerError::Network(format!("Bad listen address: {e}")))?;
        let listener = build_listener(addr)?;
        info!("🚀 Engine listening on {addr}");

        let mut tls_accept = None;
        if let Some(tls_settings) = &self.settings.tls {
            let tls_addr: SocketAddr = tls_settings
                .listen_addr
                .parse()
                .map_err(|e| ServerError::Network(format!("Bad TLS listen address: {e}")))?;
            let acceptor = tls::build_acceptor(tls_settings)?;
            let tls_listener = build_listener(tls_addr)?;
            info!("🔒 TLS engine listening on {tls_addr}");
            tls_accept = Some((tls_listener, acceptor));
        }

        self.hooks.engine_started().await;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut accept_futures = FuturesUnordered::new();
        accept_futures.push(self.accept_loop(listener, None));
        if let Some((tls_listener, acceptor)) = tls_accept {
            accept_futures.push(self.accept_loop(tls_listener, Some(acceptor)));
        }

        tokio::select! {
            _ = accept_futures.next() => {} // Accept loop(s) run until error or shutdown
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
            }
        }

        self.stopping.store(true, Ordering::SeqCst);
        stop_all(&self.registry, CloseReason::Shutdown).await;
        self.await_drain().await;
        self.hooks.engine_stopped().await;
        info!("✅ Engine stopped");
        Ok(())
    }

    /// Signals the engine to stop accepting and tear connectors down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn accept_loop(&self, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
        loop {
            if self.settings.accept_policy == AcceptPolicy::Wait {
                self.registry
                    .wait_for_capacity(self.settings.max_connections)
                    .await;
            }
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {e}");
                    break;
                }
            };
            let pending_close = match apply_accept_policy(&self.settings, &self.registry).await {
                AcceptDecision::Proceed(pending) => pending,
                AcceptDecision::Drop => continue,
            };

            let settings = self.settings.clone();
            let registry = self.registry.clone();
            let hooks = self.hooks.clone();
            let stopping = self.stopping.clone();
            let acceptor = acceptor.clone();

            // One dedicated reader task per connection.
            tokio::spawn(async move {
                let (stream, secure) = match tls::maybe_wrap(stream, acceptor.as_ref()).await {
                    Ok(wrapped) => wrapped,
                    Err(e) => {
                        warn!("🚫 {e}");
                        return;
                    }
                };
                handle_connection(
                    stream,
                    remote_addr,
                    secure,
                    settings,
                    registry,
                    hooks,
                    stopping,
                    pending_close,
                )
                .await;
            });
        }
    }

    async fn await_drain(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

/// Runs one connection from handshake to teardown.
#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: engine::BoxedStream,
    remote_addr: SocketAddr,
    secure: bool,
    settings: EngineSettings,
    registry: Arc<ConnectorRegistry>,
    hooks: Arc<dyn EngineHooks>,
    stopping: Arc<AtomicBool>,
    pending_close: Option<CloseReason>,
) {
    let Some(established) = establish(
        stream,
        remote_addr,
        secure,
        &settings,
        &registry,
        &hooks,
        pending_close,
    )
    .await
    else {
        return;
    };
    let engine::Established {
        connector,
        mut reader,
        mut decoder,
    } = established;

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = connector.cancel.notified() => break,
            read = reader.read(&mut buf) => match read {
                // Any read failure is a client-side disconnect unless a
                // reason was recorded earlier.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    decoder.feed(&buf[..n]);
                    if let PacketAction::Disconnect(_) =
                        drain_decoder(&mut decoder, &connector, &hooks).await
                    {
                        break;
                    }
                }
            }
        }
    }

    finish(connector, &registry, &hooks, stopping.load(Ordering::SeqCst)).await;
}
