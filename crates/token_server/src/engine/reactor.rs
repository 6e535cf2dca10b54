//! Reactor/worker-pool engine.
//!
//! Readers here are deliberately thin: they move raw chunks from the socket
//! onto a per-connector chunk queue and never decode. A fixed pool of
//! workers pulls connector ids off a shared dispatch queue and drains the
//! matching chunk queue through the frame decoder.
//!
//! Ordering is preserved by a per-connector claim: a connector is enqueued
//! for dispatch only when its claim flips from free to taken, so at most
//! one worker processes a given connector at any instant while distinct
//! connectors decode in parallel across the pool. After releasing the
//! claim a worker rechecks the chunk queue and re-takes the claim if bytes
//! landed in the gap, so no wakeup is ever lost.

use futures::stream::{FuturesUnordered, StreamExt as FuturesStreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use tokamak_protocol::{CloseReason, ConnectorId};

use crate::config::{AcceptPolicy, EngineSettings};
use crate::engine::{
    self, apply_accept_policy, build_listener, drain_decoder, establish, finish, stop_all,
    tls, AcceptDecision, ConnectorRegistry, EngineHooks, PacketAction,
};
use crate::engine::connector::{Connector, WsConnector};
use crate::engine::framing::FrameDecoder;
use crate::error::ServerError;

/// Decode station for one connector: its pending chunks, its claim, and
/// its frame decoder.
pub(crate) struct Station {
    connector: Arc<WsConnector>,
    chunks: StdMutex<VecDeque<Vec<u8>>>,
    claimed: AtomicBool,
    decoder: Mutex<FrameDecoder>,
}

impl Station {
    fn new(connector: Arc<WsConnector>, decoder: FrameDecoder) -> Self {
        Self {
            connector,
            chunks: StdMutex::new(VecDeque::new()),
            claimed: AtomicBool::new(false),
            decoder: Mutex::new(decoder),
        }
    }

    /// Queues a chunk; returns whether the caller just took the claim and
    /// must schedule the station for dispatch.
    fn offer(&self, chunk: Vec<u8>) -> bool {
        self.chunks.lock().unwrap().push_back(chunk);
        !self.claimed.swap(true, Ordering::AcqRel)
    }
}

struct ReactorShared {
    stations: dashmap::DashMap<ConnectorId, Arc<Station>>,
    work_tx: mpsc::UnboundedSender<ConnectorId>,
}

/// The engine form driven by a shared dispatch queue and a worker pool.
pub struct ReactorEngine {
    settings: EngineSettings,
    registry: Arc<ConnectorRegistry>,
    hooks: Arc<dyn EngineHooks>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    shared: Arc<ReactorShared>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectorId>>>,
}

impl ReactorEngine {
    /// Creates the engine. Nothing binds until [`ReactorEngine::start`].
    pub fn new(
        settings: EngineSettings,
        registry: Arc<ConnectorRegistry>,
        hooks: Arc<dyn EngineHooks>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            registry,
            hooks,
            shutdown_tx,
            stopping: Arc::new(AtomicBool::new(false)),
            shared: Arc::new(ReactorShared {
                stations: dashmap::DashMap::new(),
                work_tx,
            }),
            work_rx: Mutex::new(Some(work_rx)),
        }
    }

    /// The connector registry this engine owns.
    pub fn registry(&self) -> Arc<ConnectorRegistry> {
        self.registry.clone()
    }

    /// Binds the listeners, spawns the worker pool, and accepts until
    /// shutdown.
    pub async fn start(&self) -> Result<(), ServerError> {
        let addr: SocketAddr = self
            .settings
            .listen_addr
            .parse()
            .map_err(|e| ServerError::Network(format!("Bad listen address: {e}")))?;
        let listener = build_listener(addr)?;

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

        let worker_count = self.settings.effective_reactor_workers();
        let work_rx = self
            .work_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ServerError::Internal("reactor engine started twice".into()))?;
        let work_rx = Arc::new(Mutex::new(work_rx));
        for worker_id in 0..worker_count {
            let work_rx = work_rx.clone();
            let shared = self.shared.clone();
            let hooks = self.hooks.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                worker_loop(worker_id, work_rx, shared, hooks, &mut shutdown_rx).await;
            });
        }
        info!("🚀 Reactor engine listening on {addr} with {worker_count} workers");

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
        let _ = self.shutdown_tx.send(());
        stop_all(&self.registry, CloseReason::Shutdown).await;
        self.await_drain().await;
        self.hooks.engine_stopped().await;
        info!("✅ Reactor engine stopped");
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
            let shared = self.shared.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let (stream, secure) = match tls::maybe_wrap(stream, acceptor.as_ref()).await {
                    Ok(wrapped) => wrapped,
                    Err(e) => {
                        warn!("🚫 {e}");
                        return;
                    }
                };
                read_connection(
                    stream,
                    remote_addr,
                    secure,
                    settings,
                    registry,
                    hooks,
                    stopping,
                    shared,
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

/// The thin read side of one connection: bytes in, chunks queued, workers
/// notified. No decoding happens here.
#[allow(clippy::too_many_arguments)]
async fn read_connection(
    stream: engine::BoxedStream,
    remote_addr: SocketAddr,
    secure: bool,
    settings: EngineSettings,
    registry: Arc<ConnectorRegistry>,
    hooks: Arc<dyn EngineHooks>,
    stopping: Arc<AtomicBool>,
    shared: Arc<ReactorShared>,
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
        decoder,
    } = established;

    let station = Arc::new(Station::new(connector.clone(), decoder));
    shared.stations.insert(connector.id(), station.clone());

    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = connector.cancel.notified() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if station.offer(buf[..n].to_vec()) {
                        let _ = shared.work_tx.send(connector.id());
                    }
                }
            }
        }
    }

    shared.stations.remove(&connector.id());
    finish(connector, &registry, &hooks, stopping.load(Ordering::SeqCst)).await;
}

/// One pool worker: pull a claimed station, drain it, release the claim.
async fn worker_loop(
    worker_id: usize,
    work_rx: Arc<Mutex<mpsc::UnboundedReceiver<ConnectorId>>>,
    shared: Arc<ReactorShared>,
    hooks: Arc<dyn EngineHooks>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) {
    loop {
        let next = {
            let mut rx = work_rx.lock().await;
            tokio::select! {
                id = rx.recv() => id,
                _ = shutdown_rx.recv() => None,
            }
        };
        let Some(id) = next else {
            break;
        };
        let Some(station) = shared.stations.get(&id).map(|entry| entry.value().clone()) else {
            // The connection ended between scheduling and pickup.
            continue;
        };
        process_station(&station, &hooks).await;
    }
    tracing::debug!("Reactor worker {worker_id} exiting");
}

/// Drains a station's chunk queue while holding its claim.
async fn process_station(station: &Arc<Station>, hooks: &Arc<dyn EngineHooks>) {
    loop {
        let chunk = station.chunks.lock().unwrap().pop_front();
        match chunk {
            Some(bytes) => {
                // The claim makes this lock uncontended; it exists so the
                // decoder state moves safely between workers over time.
                let mut decoder = station.decoder.lock().await;
                decoder.feed(&bytes);
                if let PacketAction::Disconnect(_) =
                    drain_decoder(&mut decoder, &station.connector, hooks).await
                {
                    station.chunks.lock().unwrap().clear();
                }
            }
            None => {
                station.claimed.store(false, Ordering::Release);
                // Recheck for bytes that landed between the pop and the
                // release; re-take the claim instead of waiting for a
                // dispatch that will never come.
                let refilled = !station.chunks.lock().unwrap().is_empty();
                if refilled && !station.claimed.swap(true, Ordering::AcqRel) {
                    continue;
                }
                break;
            }
        }
    }
}
