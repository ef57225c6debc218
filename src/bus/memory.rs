//! In-process bus and KV store.
//!
//! Backs single-instance deployments and the integration tests, where
//! several relay instances share one `MemoryTransport` to model a
//! multi-instance deployment without a live broker.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{pattern_matches, Bus, BusError, BusFrame, KvStore};

/// Messages buffered per subscriber before lagging ones drop.
const CHANNEL_CAPACITY: usize = 256;

/// In-memory pub/sub plus KV map.
pub struct MemoryTransport {
    sender: broadcast::Sender<BusFrame>,
    kv: RwLock<HashMap<String, String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            kv: RwLock::new(HashMap::new()),
        }
    }

    /// Direct KV read for tests.
    pub fn kv_value(&self, key: &str) -> Option<String> {
        self.kv.read().expect("kv lock poisoned").get(key).cloned()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        // No subscribers is not an error; the frame is simply dropped.
        let _ = self.sender.send(BusFrame {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusFrame>, BusError> {
        let mut source = self.sender.subscribe();
        let pattern = pattern.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let frame = match source.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        log::warn!("bus subscriber lagged by {count} messages");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !pattern_matches(&pattern, &frame.channel) {
                    continue;
                }
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl KvStore for MemoryTransport {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        Ok(self.kv.read().expect("kv lock poisoned").get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BusError> {
        self.kv
            .write()
            .expect("kv lock poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }
}
