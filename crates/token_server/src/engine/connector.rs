//! Per-connection connector state and the single-writer send path.
//!
//! A connector owns everything the routing layer may touch about one
//! connection: identity, parsed handshake header, a variable bag, the
//! status machine, and the outbound queue. The capability surface is the
//! [`Connector`] trait; the engines drive the I/O around a shared
//! [`WsConnector`] according to their own scheduling discipline.
//!
//! Outbound delivery is single-writer by construction: every send enqueues
//! onto one queue drained by one writer task, so frames from one logical
//! sender are never interleaved. Each data write is guarded by a watchdog
//! timeout; control frames emitted while stopping bypass the guard so the
//! final CLOSE can still leave on a congested connection.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use tokamak_protocol::{CloseReason, ConnectorId, ConnectorStatus, Draft, FrameType, Packet};

use crate::engine::framing::{close_payload, encode_frame, CLOSE_CODE_NORMAL};
use crate::engine::handshake::RequestHeader;
use crate::error::ServerError;

/// Arbitrary per-connector key/value state (auth results, group
/// membership, client metadata).
pub type VarBag = DashMap<String, Value>;

/// Items travelling down the outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// A data packet, written under the send watchdog
    Packet(Packet),
    /// A control frame that bypasses the watchdog (send-in-transaction)
    Control(Packet),
    /// Shut the write side down and end the writer
    Shutdown,
}

/// The capability surface of a connection.
///
/// Everything above the engine (routing, plugins, tests) works against this
/// trait; the concrete type behind it is an engine detail.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Unique id within the engine instance.
    fn id(&self) -> ConnectorId;

    /// Peer address.
    fn remote_addr(&self) -> SocketAddr;

    /// Whether the connection arrived on the TLS listener.
    fn is_secure(&self) -> bool;

    /// Current lifecycle status.
    fn status(&self) -> ConnectorStatus;

    /// Negotiated protocol era.
    fn draft(&self) -> Draft;

    /// Negotiated protocol version.
    fn version(&self) -> u16;

    /// Negotiated sub-protocol, if the client offered one.
    fn sub_protocol(&self) -> Option<String>;

    /// Wire format the routing layer encodes tokens with.
    fn format(&self) -> &str;

    /// Durable session id from the handshake cookie.
    fn session_id(&self) -> &str;

    /// Parsed handshake header.
    fn header(&self) -> &RequestHeader;

    /// Per-connector variable bag.
    fn vars(&self) -> &VarBag;

    /// Enqueues a packet for delivery. Fails when the connector is not up.
    fn send(&self, packet: Packet) -> Result<(), ServerError>;

    /// Enqueues a control frame that bypasses the send watchdog. Used when
    /// the connector itself must emit a final frame while stopping.
    fn send_in_transaction(&self, packet: Packet) -> Result<(), ServerError>;

    /// Initiates teardown. In the modern era a CLOSE frame with a normal
    /// closure code goes out first; then the read side is unblocked so
    /// natural teardown runs. Calling stop on an already-down connector
    /// has no further observable effect.
    async fn stop(&self, reason: CloseReason);
}

/// Shared connector implementation used by both engines.
pub struct WsConnector {
    id: ConnectorId,
    remote_addr: SocketAddr,
    secure: bool,
    draft: Draft,
    version: u16,
    sub_protocol: Option<String>,
    format: String,
    session_id: String,
    header: RequestHeader,
    vars: VarBag,
    status: AtomicU8,
    stopping: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    out_tx: mpsc::UnboundedSender<Outbound>,
    /// Wakes the reader out of a blocked read during teardown.
    pub(crate) cancel: Notify,
}

impl WsConnector {
    /// Builds a connector from a completed handshake.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote_addr: SocketAddr,
        secure: bool,
        draft: Draft,
        version: u16,
        sub_protocol: Option<String>,
        format: String,
        session_id: String,
        header: RequestHeader,
        out_tx: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id: ConnectorId::new(),
            remote_addr,
            secure,
            draft,
            version,
            sub_protocol,
            format,
            session_id,
            header,
            vars: VarBag::new(),
            status: AtomicU8::new(ConnectorStatus::Connecting.as_u8()),
            stopping: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            out_tx,
            cancel: Notify::new(),
        }
    }

    /// Marks the connector up. Only the `Connecting -> Up` edge exists.
    pub(crate) fn mark_up(&self) -> bool {
        self.status
            .compare_exchange(
                ConnectorStatus::Connecting.as_u8(),
                ConnectorStatus::Up.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Marks the connector down, returning whether this call made the
    /// transition. `Down` is terminal, so teardown runs at most once.
    pub(crate) fn mark_down(&self) -> bool {
        self.status
            .swap(ConnectorStatus::Down.as_u8(), Ordering::SeqCst)
            != ConnectorStatus::Down.as_u8()
    }

    /// Records the close reason if none is set yet and unblocks the reader.
    /// Used by the writer watchdog and by write failures.
    pub(crate) fn force_down(&self, reason: CloseReason) {
        self.record_reason(reason);
        self.cancel.notify_one();
    }

    fn record_reason(&self, reason: CloseReason) {
        let mut slot = self.close_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
        }
    }

    /// The reason recorded by `stop`/`force_down`, if any. The engine
    /// falls back to `Client` for an unexplained read-side end.
    pub(crate) fn recorded_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().unwrap()
    }

    /// Begins teardown without emitting a CLOSE frame. Used when the peer
    /// initiated the close handshake and the echo is already queued.
    pub(crate) fn begin_close(&self, reason: CloseReason) {
        if self.status() == ConnectorStatus::Down || self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.record_reason(reason);
        let _ = self.out_tx.send(Outbound::Shutdown);
        self.cancel.notify_one();
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn id(&self) -> ConnectorId {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn status(&self) -> ConnectorStatus {
        ConnectorStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn draft(&self) -> Draft {
        self.draft
    }

    fn version(&self) -> u16 {
        self.version
    }

    fn sub_protocol(&self) -> Option<String> {
        self.sub_protocol.clone()
    }

    fn format(&self) -> &str {
        &self.format
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn vars(&self) -> &VarBag {
        &self.vars
    }

    fn send(&self, packet: Packet) -> Result<(), ServerError> {
        if self.status() != ConnectorStatus::Up {
            return Err(ServerError::ConnectorDown(self.id));
        }
        self.out_tx
            .send(Outbound::Packet(packet))
            .map_err(|_| ServerError::ConnectorDown(self.id))
    }

    fn send_in_transaction(&self, packet: Packet) -> Result<(), ServerError> {
        self.out_tx
            .send(Outbound::Control(packet))
            .map_err(|_| ServerError::ConnectorDown(self.id))
    }

    async fn stop(&self, reason: CloseReason) {
        if self.status() == ConnectorStatus::Down || self.stopping.swap(true, Ordering::SeqCst) {
            // Stop race: teardown is already underway, nothing more to do.
            return;
        }
        self.record_reason(reason);

        if self.draft == Draft::Hybi {
            let payload = close_payload(CLOSE_CODE_NORMAL, &reason.to_string());
            if self
                .send_in_transaction(Packet::new(FrameType::Close, payload))
                .is_err()
            {
                debug!("🔌 Connector {} writer already gone on stop", self.id);
            }
        }
        let _ = self.out_tx.send(Outbound::Shutdown);
        self.cancel.notify_one();
    }
}

/// Drains one connector's outbound queue onto its write half.
///
/// Consecutive queued packets are coalesced into a single guarded write so
/// the queue drains opportunistically while the socket accepts data. A
/// watchdog bounds every guarded write; when it fires, the connection is
/// treated as fatally stalled and torn down with a `Timeout` reason.
pub(crate) async fn writer_loop<W>(
    connector: std::sync::Arc<WsConnector>,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    send_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let draft = connector.draft();
    'outer: while let Some(item) = rx.recv().await {
        match item {
            Outbound::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
            Outbound::Control(packet) => match encode_frame(draft, &packet) {
                Ok(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        connector.force_down(CloseReason::Server);
                        break;
                    }
                    let _ = writer.flush().await;
                }
                Err(e) => warn!("Dropping unframeable control frame: {e}"),
            },
            Outbound::Packet(first) => {
                let mut bytes = match encode_frame(draft, &first) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Dropping unframeable packet: {e}");
                        continue;
                    }
                };
                // Fold whatever else is already queued into this write.
                let mut shutdown_after = false;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        Outbound::Packet(p) | Outbound::Control(p) => {
                            match encode_frame(draft, &p) {
                                Ok(more) => bytes.extend_from_slice(&more),
                                Err(e) => warn!("Dropping unframeable packet: {e}"),
                            }
                        }
                        Outbound::Shutdown => {
                            shutdown_after = true;
                            break;
                        }
                    }
                }

                match tokio::time::timeout(send_timeout, writer.write_all(&bytes)).await {
                    Err(_) => {
                        warn!(
                            "⏱️ Send watchdog fired for connector {}, forcing close",
                            connector.id()
                        );
                        connector.force_down(CloseReason::Timeout);
                        break 'outer;
                    }
                    Ok(Err(_)) => {
                        connector.force_down(CloseReason::Server);
                        break 'outer;
                    }
                    Ok(Ok(())) => {
                        let _ = writer.flush().await;
                    }
                }
                if shutdown_after {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    }
}
