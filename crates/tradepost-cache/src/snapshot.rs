//! Durable copy of the cache, stored under one namespaced key.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::key::QueryKey;
use crate::store::DurableStore;

/// One settled query as written to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: QueryKey,
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
    /// Marked stale by a write before the snapshot was taken
    #[serde(default)]
    pub invalidated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was written
    pub timestamp: DateTime<Utc>,
    /// Snapshots written under a different buster are thrown away
    #[serde(default)]
    pub buster: String,
    pub entries: Vec<PersistedEntry>,
}

impl Snapshot {
    pub fn new(timestamp: DateTime<Utc>, buster: &str, entries: Vec<PersistedEntry>) -> Self {
        Self {
            timestamp,
            buster: buster.to_string(),
            entries,
        }
    }

    /// Young enough and written by a compatible build
    pub fn is_usable(&self, now: DateTime<Utc>, max_age: Duration, buster: &str) -> bool {
        self.buster == buster && now - self.timestamp <= max_age
    }

    /// Read the snapshot under `storage_key`
    ///
    /// A snapshot that no longer parses is removed and treated as absent.
    pub fn load(store: &dyn DurableStore, storage_key: &str) -> Result<Option<Self>> {
        let Some(raw) = store.get(storage_key)? else {
            debug!("No cache snapshot under {}", storage_key);
            return Ok(None);
        };

        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Discarding unreadable cache snapshot: {}", e);
                store.remove(storage_key)?;
                Ok(None)
            }
        }
    }

    pub fn save(&self, store: &dyn DurableStore, storage_key: &str) -> Result<()> {
        let raw = serde_json::to_string(self)?;
        store.set(storage_key, &raw)
    }
}

/// Empty results are not worth persisting
pub fn has_content(data: &Value) -> bool {
    match data {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
