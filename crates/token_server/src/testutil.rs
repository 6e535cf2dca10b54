//! In-process connector double for routing-layer tests.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use tokamak_protocol::{CloseReason, ConnectorId, ConnectorStatus, Draft, Packet};

use crate::engine::connector::{Connector, VarBag};
use crate::engine::handshake::{parse_request, RequestHeader};
use crate::error::ServerError;

/// A connector that records what it was asked to send.
pub(crate) struct MockConnector {
    id: ConnectorId,
    format: String,
    session_id: String,
    header: RequestHeader,
    vars: VarBag,
    status: AtomicU8,
    sent: Mutex<Vec<Packet>>,
}

impl MockConnector {
    /// An `Up` connector negotiated for the given format.
    pub(crate) fn up(format: &str) -> Self {
        Self::with_session(format, &format!("session-{}", ConnectorId::new()))
    }

    /// An `Up` connector with a fixed session id.
    pub(crate) fn with_session(format: &str, session_id: &str) -> Self {
        let header = parse_request(
            b"GET / HTTP/1.1\r\nHost: test\r\nSec-WebSocket-Key: k\r\n\r\n",
        )
        .expect("static request parses");
        Self {
            id: ConnectorId::new(),
            format: format.to_string(),
            session_id: session_id.to_string(),
            header,
            vars: VarBag::new(),
            status: AtomicU8::new(ConnectorStatus::Up.as_u8()),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Everything sent so far.
    pub(crate) fn sent_packets(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn id(&self) -> ConnectorId {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn status(&self) -> ConnectorStatus {
        ConnectorStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn draft(&self) -> Draft {
        Draft::Hybi
    }

    fn version(&self) -> u16 {
        13
    }

    fn sub_protocol(&self) -> Option<String> {
        None
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
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    fn send_in_transaction(&self, packet: Packet) -> Result<(), ServerError> {
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    async fn stop(&self, _reason: CloseReason) {
        self.status
            .store(ConnectorStatus::Down.as_u8(), Ordering::SeqCst);
    }
}
