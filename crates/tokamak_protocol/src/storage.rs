//! Storage provider interface and the in-memory implementation.
//!
//! The session manager and any caching layer consume storage through this
//! trait. Entries carry an optional TTL: a TTL of zero or below never
//! expires, otherwise the entry is invalid once `insert time + ttl` has
//! passed and the next read removes it and reports absent.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;

/// Key/value storage with optional per-entry expiry.
///
/// Persistent backends (disk, external caches) implement this trait as
/// external collaborators; the in-memory [`MemoryStorage`] ships here and
/// backs sessions by default.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Reads a value. An expired entry is removed and reported as absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, ProtocolError>;

    /// Writes a value with a TTL in seconds. `ttl <= 0` never expires.
    async fn put(&self, key: &str, value: Value, ttl_seconds: i64) -> Result<(), ProtocolError>;

    /// Removes a key, returning whether it was present.
    async fn remove(&self, key: &str) -> Result<bool, ProtocolError>;

    /// Lists all live keys.
    async fn keys(&self) -> Result<Vec<String>, ProtocolError>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), ProtocolError>;

    /// Whether a live (non-expired) entry exists for the key.
    async fn contains_key(&self, key: &str) -> Result<bool, ProtocolError>;
}

struct Entry {
    value: Value,
    inserted: Instant,
    ttl_seconds: i64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.ttl_seconds > 0
            && self.inserted.elapsed() >= Duration::from_secs(self.ttl_seconds as u64)
    }
}

/// In-memory storage provider.
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Entry>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    #[cfg(test)]
    fn backdate(&self, key: &str, by: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.inserted -= by;
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, ProtocolError> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired() => true,
            Some(entry) => return Ok(Some(entry.value.clone())),
            None => return Ok(None),
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Value, ttl_seconds: i64) -> Result<(), ProtocolError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                inserted: Instant::now(),
                ttl_seconds,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, ProtocolError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, ProtocolError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self) -> Result<(), ProtocolError> {
        self.entries.clear();
        Ok(())
    }

    async fn contains_key(&self, key: &str) -> Result<bool, ProtocolError> {
        Ok(self.get(key).await?.is_some())
    }
}
