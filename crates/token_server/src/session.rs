//! Session and reconnection management.
//!
//! Every connector carries a durable session id from its handshake cookie.
//! The session manager maps that id to a storage-backed variable bag that
//! survives the connection. On disconnect the session enters a bounded
//! reconnection window: its id is marked in a TTL-bearing reconnection
//! index and its absolute expiry lands in a trash index. A periodic sweep
//! purges the backing storage of every trash entry whose expiry passed, so
//! abandoned sessions cannot grow the store forever.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tokamak_protocol::{ProtocolError, StorageProvider};

use crate::error::ServerError;

const SESSION_PREFIX: &str = "sess::";
const RECONNECTION_PREFIX: &str = "recon::";
const TRASH_PREFIX: &str = "trash::";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A session's variable bag, namespaced into the shared storage provider.
pub struct SessionStorage {
    provider: Arc<dyn StorageProvider>,
    session_id: String,
}

impl SessionStorage {
    fn new(provider: Arc<dyn StorageProvider>, session_id: &str) -> Self {
        Self {
            provider,
            session_id: session_id.to_string(),
        }
    }

    /// The session this storage belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn scoped(&self, key: &str) -> String {
        format!("{SESSION_PREFIX}{}::{key}", self.session_id)
    }

    /// Reads a session variable.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, ProtocolError> {
        self.provider.get(&self.scoped(key)).await
    }

    /// Writes a session variable. Session variables never self-expire;
    /// the reconnection sweep owns their lifetime.
    pub async fn put(&self, key: &str, value: Value) -> Result<(), ProtocolError> {
        self.provider.put(&self.scoped(key), value, 0).await
    }

    /// Removes a session variable.
    pub async fn remove(&self, key: &str) -> Result<bool, ProtocolError> {
        self.provider.remove(&self.scoped(key)).await
    }

    /// Lists the session's variable names.
    pub async fn keys(&self) -> Result<Vec<String>, ProtocolError> {
        let prefix = format!("{SESSION_PREFIX}{}::", self.session_id);
        Ok(self
            .provider
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Removes every variable of this session.
    pub async fn clear(&self) -> Result<(), ProtocolError> {
        let prefix = format!("{SESSION_PREFIX}{}::", self.session_id);
        for key in self.provider.keys().await? {
            if key.starts_with(&prefix) {
                self.provider.remove(&key).await?;
            }
        }
        Ok(())
    }
}

/// Maps durable session ids to storage and runs the reconnection window.
pub struct SessionManager {
    provider: Arc<dyn StorageProvider>,
    cache: DashMap<String, Arc<SessionStorage>>,
    reconnection_ttl: Duration,
}

impl SessionManager {
    /// Creates a manager over a storage provider.
    pub fn new(provider: Arc<dyn StorageProvider>, reconnection_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            provider,
            cache: DashMap::new(),
            reconnection_ttl,
        })
    }

    fn reconnection_key(session_id: &str) -> String {
        format!("{RECONNECTION_PREFIX}{session_id}")
    }

    fn trash_key(session_id: &str) -> String {
        format!("{TRASH_PREFIX}{session_id}")
    }

    /// Returns the session's storage.
    ///
    /// A cached reference is returned as-is. Otherwise, a session still
    /// inside its reconnection window is recovered: its storage is kept and
    /// its reconnection and trash entries are cleared. An expired or
    /// unknown session gets a fresh, empty storage.
    pub async fn get_session(&self, session_id: &str) -> Result<Arc<SessionStorage>, ServerError> {
        if let Some(cached) = self.cache.get(session_id) {
            return Ok(cached.value().clone());
        }

        let storage = Arc::new(SessionStorage::new(self.provider.clone(), session_id));
        let trash_key = Self::trash_key(session_id);
        let still_valid = self
            .provider
            .get(&trash_key)
            .await
            .map_err(ServerError::Protocol)?
            .and_then(|value| value.as_i64())
            .map(|expiry| expiry > now_millis())
            .unwrap_or(false);

        if still_valid {
            // Successful reconnection: leave the storage intact.
            self.provider
                .remove(&Self::reconnection_key(session_id))
                .await
                .map_err(ServerError::Protocol)?;
            self.provider
                .remove(&trash_key)
                .await
                .map_err(ServerError::Protocol)?;
            info!("🔁 Session {session_id} recovered within its reconnection window");
        } else {
            storage.clear().await.map_err(ServerError::Protocol)?;
            self.provider
                .remove(&trash_key)
                .await
                .map_err(ServerError::Protocol)?;
            debug!("🆕 Session {session_id} allocated fresh storage");
        }

        self.cache.insert(session_id.to_string(), storage.clone());
        Ok(storage)
    }

    /// Marks a disconnected session for reconnection.
    ///
    /// The id lands in the TTL-bearing reconnection index and its absolute
    /// expiry in the trash index the sweep consults.
    pub async fn put_in_reconnection_mode(&self, session_id: &str) {
        self.cache.remove(session_id);
        let ttl_seconds = (self.reconnection_ttl.as_millis() as i64 + 999) / 1000;
        let expiry = now_millis() + self.reconnection_ttl.as_millis() as i64;

        if let Err(e) = self
            .provider
            .put(&Self::reconnection_key(session_id), json!(true), ttl_seconds)
            .await
        {
            warn!("⚠️ Failed to index session {session_id} for reconnection: {e}");
            return;
        }
        if let Err(e) = self
            .provider
            .put(&Self::trash_key(session_id), json!(expiry), 0)
            .await
        {
            warn!("⚠️ Failed to record expiry for session {session_id}: {e}");
            return;
        }
        debug!("💤 Session {session_id} in reconnection mode for {:?}", self.reconnection_ttl);
    }

    /// One sweep pass: purge storage for every trash entry whose expiry
    /// passed and no reconnect cleared it.
    pub async fn sweep_once(&self) {
        let now = now_millis();
        let keys = match self.provider.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!("⚠️ Session sweep cannot list storage: {e}");
                return;
            }
        };
        for key in keys {
            let Some(session_id) = key.strip_prefix(TRASH_PREFIX) else {
                continue;
            };
            let expired = match self.provider.get(&key).await {
                Ok(value) => value
                    .and_then(|v| v.as_i64())
                    .map(|expiry| expiry <= now)
                    .unwrap_or(true),
                Err(_) => continue,
            };
            if !expired {
                continue;
            }
            let storage = SessionStorage::new(self.provider.clone(), session_id);
            if let Err(e) = storage.clear().await {
                warn!("⚠️ Failed to purge expired session {session_id}: {e}");
                continue;
            }
            let _ = self.provider.remove(&key).await;
            let _ = self
                .provider
                .remove(&Self::reconnection_key(session_id))
                .await;
            info!("🧹 Expired session {session_id} purged");
        }
    }

    /// Spawns the periodic expiry sweep.
    pub fn start_sweep(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh server
            // does not sweep before anything can expire.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep_once().await;
            }
        })
    }
}
