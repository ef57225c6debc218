//! Room snapshot persistence over the KV adapter.
//!
//! Each room's full state lives under a single string key,
//! `room:{roomId}:state`, as base64 text of the CRDT's self-contained
//! state update. Callers treat every failure here as non-fatal: the relay
//! prefers availability to durability, and a later update or reconnect
//! re-persists the converged state.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::bus::{BusError, KvStore};

/// Persistence errors.
#[derive(Debug)]
pub enum StoreError {
    /// The KV backend failed.
    Backend(String),
    /// The stored value was not valid base64.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "snapshot backend error: {e}"),
            StoreError::Corrupt(e) => write!(f, "corrupt snapshot: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<BusError> for StoreError {
    fn from(e: BusError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Snapshot load/save for rooms.
#[derive(Clone)]
pub struct SnapshotStore {
    kv: Arc<dyn KvStore>,
}

impl SnapshotStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// The KV key holding a room's snapshot.
    pub fn key(room_id: &str) -> String {
        format!("room:{room_id}:state")
    }

    /// Load a room's persisted snapshot, if any.
    pub async fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.kv.get(&Self::key(room_id)).await? {
            Some(text) => {
                let bytes = BASE64
                    .decode(text.as_bytes())
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    /// Persist a room's full state.
    pub async fn save(&self, room_id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.kv
            .set(&Self::key(room_id), BASE64.encode(state))
            .await?;
        Ok(())
    }
}
