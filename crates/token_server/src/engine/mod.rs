//! The connection engine.
//!
//! The engine owns the listening sockets (plain and TLS), accepts
//! connections under the configured cap policy, runs the handshake,
//! instantiates connectors, keeps the connector registry, and fires
//! lifecycle events to the routing layer through [`EngineHooks`].
//!
//! Two engine forms share everything in this module and differ only in
//! scheduling discipline: [`spawn::SpawnEngine`] dedicates a reader task to
//! every connection, [`reactor::ReactorEngine`] fans raw chunks into a
//! worker pool with a per-connector claim.

pub mod connector;
pub mod framing;
pub mod handshake;
pub mod reactor;
pub mod spawn;
pub mod tls;

use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use tokamak_protocol::{
    CloseReason, ConnectorId, ConnectorStatus, FrameType, Packet, ProtocolError,
};

use crate::config::{AcceptPolicy, EngineSettings};
use crate::error::ServerError;
use connector::{writer_loop, Connector, WsConnector};
use framing::FrameDecoder;

/// Object-safe stream bound: plain TCP and TLS both erase to this.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

/// A type-erased connection stream.
pub type BoxedStream = Box<dyn IoStream>;

/// Lifecycle events the engine delivers to the routing layer.
#[async_trait]
pub trait EngineHooks: Send + Sync {
    /// The engine finished binding its listeners.
    async fn engine_started(&self);

    /// The engine stopped accepting and tore every connector down.
    async fn engine_stopped(&self);

    /// A connector completed its handshake and is up.
    async fn connector_started(&self, connector: Arc<dyn Connector>);

    /// A connector reached `Down`; fired exactly once per connector.
    async fn connector_stopped(&self, connector: Arc<dyn Connector>, reason: CloseReason);

    /// A data packet arrived on an up connector.
    async fn packet_received(&self, connector: Arc<dyn Connector>, packet: Packet);
}

/// The engine's connector set, keyed by id.
///
/// Entries are added and removed only by the owning engine; the routing
/// layer reads concurrently without further locking.
pub struct ConnectorRegistry {
    map: DashMap<ConnectorId, Arc<dyn Connector>>,
    capacity_freed: Notify,
}

impl ConnectorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            capacity_freed: Notify::new(),
        }
    }

    pub(crate) fn register(&self, connector: Arc<dyn Connector>) {
        self.map.insert(connector.id(), connector);
    }

    pub(crate) fn unregister(&self, id: &ConnectorId) -> Option<Arc<dyn Connector>> {
        let removed = self.map.remove(id).map(|(_, c)| c);
        if removed.is_some() {
            self.capacity_freed.notify_waiters();
        }
        removed
    }

    /// Looks a connector up by id.
    pub fn get(&self, id: &ConnectorId) -> Option<Arc<dyn Connector>> {
        self.map.get(id).map(|entry| entry.value().clone())
    }

    /// Number of registered connectors.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Snapshot of all connectors currently up.
    pub fn up_connectors(&self) -> Vec<Arc<dyn Connector>> {
        self.map
            .iter()
            .filter(|entry| entry.value().status() == ConnectorStatus::Up)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Waits until the registry is below the given cap.
    pub(crate) async fn wait_for_capacity(&self, max: usize) {
        loop {
            // Register interest before re-checking so a removal landing in
            // between cannot be missed.
            let mut notified = std::pin::pin!(self.capacity_freed.notified());
            notified.as_mut().enable();
            if self.map.len() < max {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// What the accept loop should do with a fresh connection.
pub(crate) enum AcceptDecision {
    /// Continue; if a reason is attached, the connector completes its
    /// handshake and is then closed with that reason.
    Proceed(Option<CloseReason>),
    /// Drop the socket without a handshake.
    Drop,
}

/// Applies the configured over-cap policy to a fresh connection.
pub(crate) async fn apply_accept_policy(
    settings: &EngineSettings,
    registry: &ConnectorRegistry,
) -> AcceptDecision {
    if registry.len() < settings.max_connections {
        return AcceptDecision::Proceed(None);
    }
    match settings.accept_policy {
        AcceptPolicy::Wait => {
            registry.wait_for_capacity(settings.max_connections).await;
            AcceptDecision::Proceed(None)
        }
        AcceptPolicy::Close => AcceptDecision::Drop,
        AcceptPolicy::Reject => AcceptDecision::Proceed(Some(CloseReason::Reject)),
        AcceptPolicy::Redirect => AcceptDecision::Proceed(Some(CloseReason::Redirect)),
    }
}

/// Builds the TCP listener: socket2 with address reuse, handed to tokio.
pub(crate) fn build_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::net::TcpListener as StdTcpListener;

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true).ok();
    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}

/// A connection that made it through the handshake.
pub(crate) struct Established {
    pub connector: Arc<WsConnector>,
    pub reader: ReadHalf<BoxedStream>,
    pub decoder: FrameDecoder,
}

/// Runs the handshake and brings a connector up.
///
/// A failed handshake closes the socket with no protocol response and
/// returns `None`. When `pending_close` carries a reason (over-cap reject
/// or redirect), the connector is stopped right after it starts, so the
/// client sees a proper close with the reason where the era supports one.
pub(crate) async fn establish(
    mut stream: BoxedStream,
    remote_addr: SocketAddr,
    secure: bool,
    settings: &EngineSettings,
    registry: &Arc<ConnectorRegistry>,
    hooks: &Arc<dyn EngineHooks>,
    pending_close: Option<CloseReason>,
) -> Option<Established> {
    let raw = match handshake::read_request(&mut stream, settings.connect_timeout()).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!("🚫 Handshake read from {remote_addr} failed: {e}");
            return None;
        }
    };
    let negotiated = match handshake::parse_request(&raw).and_then(|header| {
        handshake::negotiate(header, &settings.allowed_origins)
    }) {
        Ok(negotiated) => negotiated,
        Err(e) => {
            // Rejected handshakes get no response bytes at all.
            debug!("🚫 Handshake from {remote_addr} rejected: {e}");
            return None;
        }
    };

    if stream.write_all(&negotiated.response).await.is_err() {
        debug!("🚫 Peer {remote_addr} vanished during handshake response");
        return None;
    }

    let draft = negotiated.header.draft;
    let version = negotiated.header.version;
    let decoder = FrameDecoder::new(draft, settings.max_frame_size);
    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    let connector = Arc::new(WsConnector::new(
        remote_addr,
        secure,
        draft,
        version,
        negotiated.sub_protocol,
        negotiated.format,
        negotiated.session_id,
        negotiated.header,
        out_tx,
    ));
    tokio::spawn(writer_loop(
        connector.clone(),
        writer,
        out_rx,
        settings.send_timeout(),
    ));

    registry.register(connector.clone());
    connector.mark_up();
    info!(
        "🔗 Connector {} up from {remote_addr} ({draft} v{version}, format {})",
        connector.id(),
        Connector::format(connector.as_ref()),
    );
    hooks.connector_started(connector.clone()).await;

    if let Some(reason) = pending_close {
        connector.stop(reason).await;
    }

    Some(Established {
        connector,
        reader,
        decoder,
    })
}

/// What to do after handling one decoded packet.
pub(crate) enum PacketAction {
    Continue,
    Disconnect(CloseReason),
}

/// Handles one decoded packet: control frames locally, data to the hooks.
pub(crate) async fn dispatch_packet(
    connector: &Arc<WsConnector>,
    packet: Packet,
    hooks: &Arc<dyn EngineHooks>,
) -> PacketAction {
    match packet.frame_type {
        FrameType::Ping => {
            // Pong echoes the ping payload.
            let _ = connector.send(Packet::new(FrameType::Pong, packet.payload));
            PacketAction::Continue
        }
        FrameType::Pong => PacketAction::Continue,
        FrameType::Close => {
            // Echo the close, then tear down without a second CLOSE frame.
            let _ = connector.send_in_transaction(Packet::new(FrameType::Close, packet.payload));
            connector.begin_close(CloseReason::Client);
            PacketAction::Disconnect(CloseReason::Client)
        }
        FrameType::Invalid => {
            warn!(
                "⚠️ Discarding frame with unrecognized opcode from connector {}",
                connector.id()
            );
            PacketAction::Continue
        }
        FrameType::Text | FrameType::Binary | FrameType::Fragment => {
            hooks
                .packet_received(connector.clone() as Arc<dyn Connector>, packet)
                .await;
            PacketAction::Continue
        }
    }
}

/// Drains every frame already buffered in the decoder.
///
/// Keeps unframing without waiting for another readiness notification, so
/// a burst of queued messages from one peer is processed in one pass.
pub(crate) async fn drain_decoder(
    decoder: &mut FrameDecoder,
    connector: &Arc<WsConnector>,
    hooks: &Arc<dyn EngineHooks>,
) -> PacketAction {
    loop {
        match decoder.next() {
            Ok(Some(packet)) => {
                if let PacketAction::Disconnect(reason) =
                    dispatch_packet(connector, packet, hooks).await
                {
                    return PacketAction::Disconnect(reason);
                }
            }
            Ok(None) => return PacketAction::Continue,
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                warn!(
                    "⚠️ Connector {} sent a {size} byte frame (max {max}), disconnecting",
                    connector.id()
                );
                connector.stop(CloseReason::Server).await;
                return PacketAction::Disconnect(CloseReason::Server);
            }
            Err(e) => {
                warn!(
                    "⚠️ Framing violation from connector {}: {e}, disconnecting",
                    connector.id()
                );
                connector.stop(CloseReason::Server).await;
                return PacketAction::Disconnect(CloseReason::Server);
            }
        }
    }
}

/// Tears a connector down exactly once and fires `connector_stopped`.
pub(crate) async fn finish(
    connector: Arc<WsConnector>,
    registry: &Arc<ConnectorRegistry>,
    hooks: &Arc<dyn EngineHooks>,
    engine_stopping: bool,
) {
    if !connector.mark_down() {
        // Lost the teardown race; the winner already fired the event.
        return;
    }
    let reason = connector.recorded_reason().unwrap_or(if engine_stopping {
        CloseReason::Shutdown
    } else {
        CloseReason::Client
    });
    registry.unregister(&connector.id());
    info!("👋 Connector {} stopped: {reason}", connector.id());
    hooks
        .connector_stopped(connector as Arc<dyn Connector>, reason)
        .await;
}

/// Stops every registered connector with the given reason.
pub(crate) async fn stop_all(registry: &Arc<ConnectorRegistry>, reason: CloseReason) {
    for connector in registry.up_connectors() {
        connector.stop(reason).await;
    }
}
