//! Redis-backed bus and KV store.
//!
//! Two logical connections, as is typical for Redis pub/sub: a
//! [`ConnectionManager`] shared for `PUBLISH` and KV commands (it
//! reconnects transparently), and a dedicated pub/sub connection per
//! pattern subscription, since a subscribed Redis connection cannot issue
//! other commands.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::{Bus, BusError, BusFrame, KvStore};

/// Bus + KV over a shared Redis broker.
pub struct RedisTransport {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisTransport {
    /// Connect to the broker at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        log::info!("connected to bus at {url}");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Bus for RedisTransport {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<BusFrame>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        log::info!("subscribed to bus pattern {pattern}");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("dropping non-text bus message on {channel}: {e}");
                        continue;
                    }
                };
                if tx.send(BusFrame { channel, payload }).is_err() {
                    break;
                }
            }
            log::info!("bus subscription closed");
        });

        Ok(rx)
    }
}

#[async_trait]
impl KvStore for RedisTransport {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| BusError::Kv(e.to_string()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| BusError::Kv(e.to_string()))
    }
}
