//! Pub/sub bus and key-value adapters.
//!
//! The relay talks to the outside world through two small traits: [`Bus`]
//! for pattern-subscribed fan-out across instances and [`KvStore`] for
//! room snapshots. [`RedisTransport`] implements both over a shared
//! broker; [`MemoryTransport`] implements both in-process for tests and
//! single-instance deployments.

pub mod memory;
pub mod redis;

pub use memory::MemoryTransport;
pub use redis::RedisTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One message delivered by a pattern subscription.
#[derive(Debug, Clone)]
pub struct BusFrame {
    pub channel: String,
    pub payload: String,
}

/// Errors from the bus or KV backend.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("key-value operation failed: {0}")]
    Kv(String),
}

/// Cross-instance publish/subscribe.
///
/// Implementations must be safe for concurrent use; the relay shares one
/// handle across all rooms.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    /// Subscribe to all channels matching a pattern.
    ///
    /// Delivery runs until the receiver is dropped or the backend
    /// connection closes.
    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusFrame>, BusError>;
}

/// Simple string key-value storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;
    async fn set(&self, key: &str, value: String) -> Result<(), BusError>;
}

/// Glob match supporting a single trailing `*`, the only pattern shape
/// the relay subscribes with (`room:*`).
pub(crate) fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}
