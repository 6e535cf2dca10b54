//! Inbound token fragment reassembly.
//!
//! Large tokens may arrive split into fragment tokens tagged with a
//! transfer id plus total/index counters. Partial transfers are buffered
//! keyed by `(connector, transfer id)`; once every index is present the
//! accumulated payload is handed back to the router to be decoded as one
//! token, and the partial state is discarded.

use dashmap::DashMap;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use tokamak_protocol::{ConnectorId, Token};

/// Token type marking a fragment of a larger token.
pub const TT_FRAGMENT: &str = "fragment";

const FIELD_TRANSFER_ID: &str = "tid";
const FIELD_TOTAL: &str = "total";
const FIELD_INDEX: &str = "index";
const FIELD_DATA: &str = "data";

struct FragmentBuffer {
    total: usize,
    parts: BTreeMap<usize, String>,
}

/// Buffers partial transfers per connector.
#[derive(Default)]
pub(crate) struct FragmentStore {
    buffers: DashMap<(ConnectorId, String), FragmentBuffer>,
}

impl FragmentStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether a token is a fragment marker.
    pub(crate) fn is_fragment(token: &Token) -> bool {
        token.token_type == TT_FRAGMENT
    }

    /// Absorbs one fragment. Returns the reassembled payload once the
    /// transfer is complete, `None` while parts are still missing.
    pub(crate) fn offer(&self, connector_id: ConnectorId, token: &Token) -> Option<Vec<u8>> {
        let (Some(tid), Some(total), Some(index), Some(data)) = (
            token.get_string(FIELD_TRANSFER_ID),
            token.get_i64(FIELD_TOTAL),
            token.get_i64(FIELD_INDEX),
            token.get_string(FIELD_DATA),
        ) else {
            warn!("⚠️ Dropping malformed fragment token from {connector_id}");
            return None;
        };
        if total <= 0 || index < 0 || index >= total {
            warn!("⚠️ Dropping fragment with bad counters ({index}/{total}) from {connector_id}");
            return None;
        }

        let key = (connector_id, tid.to_string());
        let mut buffer = self.buffers.entry(key.clone()).or_insert_with(|| {
            FragmentBuffer {
                total: total as usize,
                parts: BTreeMap::new(),
            }
        });
        buffer.parts.insert(index as usize, data.to_string());

        if buffer.parts.len() < buffer.total {
            return None;
        }
        drop(buffer);

        // Complete: concatenate in index order and drop the partial state.
        let (_, buffer) = self.buffers.remove(&key)?;
        debug!(
            "🧩 Transfer {} from {connector_id} reassembled from {} parts",
            key.1, buffer.total
        );
        let mut payload = String::new();
        for part in buffer.parts.values() {
            payload.push_str(part);
        }
        Some(payload.into_bytes())
    }

    /// Discards all partial transfers of a connector.
    pub(crate) fn clear_connector(&self, connector_id: ConnectorId) {
        self.buffers.retain(|(owner, _), _| *owner != connector_id);
    }
}
