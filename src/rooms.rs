//! Room lifecycle and update fan-out.
//!
//! The manager owns the room map and is the single source of truth for
//! which rooms exist on this instance. Every applied update flows through
//! it: locally received updates are broadcast to local peers, published
//! on the bus tagged with this instance's id, and persisted; bus-received
//! updates are applied and broadcast but never republished — the
//! instance-id tag on ingress is the only thing standing between a
//! multi-instance deployment and an infinite publish/receive cycle.
//!
//! Room lifecycle:
//!
//! ```text
//! (absent) ──ensure_room──► Active[empty]
//! Active[empty] ──attach──► Active[nonempty]
//! Active[nonempty] ──detach (last)──► Draining (timer armed)
//! Draining ──attach──► Active[nonempty]   (timer cancelled)
//! Draining ──timer fires──► (absent)      (persisted, removed)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::bus::{Bus, BusFrame};
use crate::metrics::Metrics;
use crate::protocol::{decode_update, encode_update, BusEnvelope, SyncFrame};
use crate::room::{ConnId, Peer, Room};
use crate::store::SnapshotStore;

/// Map from room id to room, plus everything an applied update touches.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    store: SnapshotStore,
    bus: Arc<dyn Bus>,
    metrics: Arc<Metrics>,
    instance_id: String,
    eviction_grace: Duration,
}

impl RoomManager {
    pub fn new(
        store: SnapshotStore,
        bus: Arc<dyn Bus>,
        metrics: Arc<Metrics>,
        instance_id: impl Into<String>,
        eviction_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            bus,
            metrics,
            instance_id: instance_id.into(),
            eviction_grace,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Get the room, creating it if absent.
    ///
    /// A fresh room starts from the persisted snapshot when one loads
    /// cleanly; any snapshot failure is logged and the room starts empty
    /// (availability over durability). An existing room has any pending
    /// eviction cancelled.
    pub async fn ensure_room(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                room.cancel_eviction().await;
                return room.clone();
            }
        }

        // Load the snapshot before taking the write lock; a KV round trip
        // must not serialize unrelated rooms.
        let doc = crate::crdt::Document::new();
        match self.store.load(room_id).await {
            Ok(Some(snapshot)) => match doc.apply_update(&snapshot) {
                Ok(()) => log::info!("room {room_id}: loaded persisted snapshot"),
                Err(e) => log::warn!("room {room_id}: ignoring bad snapshot: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::warn!("room {room_id}: snapshot load failed, starting empty: {e}"),
        }

        let mut rooms = self.rooms.write().await;
        // Another task may have created the room while we were loading.
        if let Some(room) = rooms.get(room_id) {
            room.cancel_eviction().await;
            return room.clone();
        }
        let room = Arc::new(Room::with_doc(room_id, doc));
        rooms.insert(room_id.to_string(), room.clone());
        self.metrics.active_rooms.set(rooms.len() as i64);
        log::info!("room {room_id} created ({} active)", rooms.len());
        room
    }

    /// Attach a socket to a room.
    ///
    /// Returns `None` when the room was evicted between `ensure_room` and
    /// this call; the caller re-ensures and retries. Holding the map read
    /// lock across the insert serializes attach against eviction's
    /// re-check, which runs under the write lock.
    pub async fn attach(&self, room_id: &str, conn: ConnId, peer: Peer) -> Option<Arc<Room>> {
        let room = {
            let rooms = self.rooms.read().await;
            let room = rooms.get(room_id)?.clone();
            room.cancel_eviction().await;
            room.attach(conn, peer).await;
            room
        };
        self.refresh_client_gauge().await;
        Some(room)
    }

    /// Detach a socket; arms the eviction timer when the room empties.
    pub async fn detach(self: &Arc<Self>, room_id: &str, conn: ConnId) {
        let room = {
            let rooms = self.rooms.read().await;
            match rooms.get(room_id) {
                Some(room) => room.clone(),
                None => return,
            }
        };
        let remaining = room.detach(conn).await;
        self.refresh_client_gauge().await;

        if remaining == 0 {
            self.arm_eviction(&room).await;
        }
    }

    /// Start the eviction countdown for an empty room, replacing any
    /// previous timer.
    async fn arm_eviction(self: &Arc<Self>, room: &Arc<Room>) {
        let manager = self.clone();
        let target = room.clone();
        let grace = self.eviction_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.evict(&target).await;
        });
        room.set_eviction(handle).await;
        log::debug!("room {} drained, eviction in {grace:?}", room.id);
    }

    /// Timer callback: persist and drop an idle room.
    ///
    /// Re-checks under the map write lock that the room is still empty and
    /// still the registered instance for its id, so a reattach or a
    /// recreated room survives a stale timer.
    pub async fn evict(&self, room: &Arc<Room>) {
        if room.peer_count().await > 0 {
            return;
        }
        self.persist_room(room).await;

        let mut rooms = self.rooms.write().await;
        let still_idle = match rooms.get(&room.id) {
            Some(current) if Arc::ptr_eq(current, room) => current.peer_count().await == 0,
            _ => false,
        };
        if still_idle {
            rooms.remove(&room.id);
            self.metrics.active_rooms.set(rooms.len() as i64);
            log::info!("room {} evicted ({} active)", room.id, rooms.len());
        }
    }

    /// Apply a locally received update: document first, then local
    /// fan-out (excluding the originator), bus publish, and persistence.
    pub async fn apply_local(&self, room: &Arc<Room>, origin: ConnId, bytes: Vec<u8>) {
        let update_b64 = encode_update(&bytes);
        let frame = SyncFrame::update(update_b64.clone(), self.instance_id.clone());
        let sent = match room.apply_and_broadcast(&bytes, &frame, Some(origin)).await {
            Ok(sent) => sent,
            Err(e) => {
                log::warn!("room {}: dropping update: {e}", room.id);
                return;
            }
        };
        self.metrics.updates_total.inc();
        self.metrics.messages_sent_total.inc_by(sent as u64);

        let envelope = BusEnvelope::new(self.instance_id.clone(), room.id.clone(), update_b64);
        match envelope.encode() {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&BusEnvelope::channel(&room.id), payload).await {
                    // Local peers already saw the update; remote instances
                    // reconverge from a later update or reconnect.
                    log::warn!("room {}: bus publish failed: {e}", room.id);
                }
            }
            Err(e) => log::error!("room {}: failed to encode bus envelope: {e}", room.id),
        }

        self.persist_room(room).await;
    }

    /// Apply an update received from the bus.
    ///
    /// Envelopes tagged with this instance's id are dropped immediately
    /// (echo suppression). Accepted envelopes may create the room here
    /// even with no local clients, so state is warm when one joins; such
    /// a room gets an eviction timer so it does not stay resident
    /// forever. Bus-originated updates are never republished.
    pub async fn apply_from_bus(self: &Arc<Self>, envelope: BusEnvelope) {
        if envelope.instance_id == self.instance_id {
            return;
        }
        let bytes = match decode_update(&envelope.update) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("room {}: dropping bus update: {e}", envelope.room);
                return;
            }
        };

        let room = self.ensure_room(&envelope.room).await;
        let frame = SyncFrame::update(envelope.update, envelope.instance_id);
        let sent = match room.apply_and_broadcast(&bytes, &frame, None).await {
            Ok(sent) => sent,
            Err(e) => {
                log::warn!("room {}: dropping bus update: {e}", room.id);
                return;
            }
        };
        self.metrics.updates_total.inc();
        self.metrics.messages_sent_total.inc_by(sent as u64);

        self.persist_room(&room).await;

        if room.peer_count().await == 0 {
            self.arm_eviction(&room).await;
        }
    }

    /// Drain the bus subscription, dispatching envelopes to rooms.
    /// Runs until the subscription closes.
    pub async fn run_bus_ingress(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<BusFrame>) {
        while let Some(frame) = receiver.recv().await {
            match BusEnvelope::decode(&frame.payload) {
                Ok(envelope) => self.apply_from_bus(envelope).await,
                Err(e) => {
                    log::warn!("dropping malformed bus envelope on {}: {e}", frame.channel)
                }
            }
        }
        log::info!("bus ingress stopped");
    }

    /// Persist one room by id. No-op for unknown rooms.
    pub async fn persist(&self, room_id: &str) {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(room_id).cloned()
        };
        if let Some(room) = room {
            self.persist_room(&room).await;
        }
    }

    /// Persist every resident room; the shutdown path.
    pub async fn persist_all(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        log::info!("persisting {} rooms", rooms.len());
        for room in rooms {
            self.persist_room(&room).await;
        }
    }

    async fn persist_room(&self, room: &Room) {
        let state = room.encode_state().await;
        match self.store.save(&room.id, &state).await {
            Ok(()) => log::debug!("room {}: persisted {} bytes", room.id, state.len()),
            Err(e) => log::warn!("room {}: persistence failed: {e}", room.id),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Recompute the connected-clients gauge as the sum of socket-set
    /// sizes across rooms.
    async fn refresh_client_gauge(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut total = 0usize;
        for room in rooms {
            total += room.peer_count().await;
        }
        self.metrics.connected_clients.set(total as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{KvStore, MemoryTransport};
    use tokio::time::{sleep, timeout, Duration};
    use uuid::Uuid;
    use yrs::{Text, Transact};

    fn text_update(doc: &yrs::Doc, index: u32, content: &str) -> Vec<u8> {
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, index, content);
        txn.encode_update_v1()
    }

    fn manager_on(
        transport: Arc<MemoryTransport>,
        instance_id: &str,
        grace: Duration,
    ) -> (Arc<RoomManager>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let manager = RoomManager::new(
            SnapshotStore::new(transport.clone()),
            transport,
            metrics.clone(),
            instance_id,
            grace,
        );
        (manager, metrics)
    }

    fn test_manager() -> (Arc<RoomManager>, Arc<Metrics>) {
        manager_on(
            Arc::new(MemoryTransport::new()),
            "instance-1",
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_ensure_room_is_idempotent() {
        let (manager, metrics) = test_manager();
        let a = manager.ensure_room("r1").await;
        let b = manager.ensure_room("r1").await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(metrics.active_rooms.get(), 1);
    }

    #[tokio::test]
    async fn test_attach_detach_updates_gauge() {
        let (manager, metrics) = test_manager();
        manager.ensure_room("r1").await;

        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.attach("r1", conn, Peer::new("c1", tx)).await.unwrap();
        assert_eq!(metrics.connected_clients.get(), 1);

        manager.detach("r1", conn).await;
        assert_eq!(metrics.connected_clients.get(), 0);
    }

    #[tokio::test]
    async fn test_attach_to_unknown_room_returns_none() {
        let (manager, _) = test_manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(manager
            .attach("ghost", Uuid::new_v4(), Peer::new("c1", tx))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_apply_local_publishes_tagged_envelope() {
        let transport = Arc::new(MemoryTransport::new());
        let mut bus_rx = transport.subscribe_pattern("room:*").await.unwrap();
        let (manager, metrics) = manager_on(transport, "instance-1", Duration::from_secs(60));

        let room = manager.ensure_room("r1").await;
        let update = text_update(&yrs::Doc::new(), 0, "x");
        manager.apply_local(&room, Uuid::new_v4(), update.clone()).await;

        let frame = timeout(Duration::from_secs(1), bus_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.channel, "room:r1");
        let envelope = BusEnvelope::decode(&frame.payload).unwrap();
        assert_eq!(envelope.instance_id, "instance-1");
        assert_eq!(decode_update(&envelope.update).unwrap(), update);
        assert_eq!(metrics.updates_total.get(), 1);
    }

    #[tokio::test]
    async fn test_apply_local_persists_state() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _) = manager_on(transport.clone(), "instance-1", Duration::from_secs(60));

        let room = manager.ensure_room("r1").await;
        manager
            .apply_local(&room, Uuid::new_v4(), text_update(&yrs::Doc::new(), 0, "x"))
            .await;

        assert!(transport.kv_value("room:r1:state").is_some());
    }

    #[tokio::test]
    async fn test_bus_echo_is_suppressed() {
        let (manager, metrics) = test_manager();
        let update = text_update(&yrs::Doc::new(), 0, "x");
        let envelope = BusEnvelope::new("instance-1", "r1", encode_update(&update));

        manager.apply_from_bus(envelope).await;

        // Our own envelope must not create rooms or apply updates.
        assert_eq!(manager.room_count().await, 0);
        assert_eq!(metrics.updates_total.get(), 0);
    }

    #[tokio::test]
    async fn test_bus_update_warms_room_without_local_clients() {
        let (manager, metrics) = test_manager();
        let update = text_update(&yrs::Doc::new(), 0, "warm");
        let envelope = BusEnvelope::new("instance-2", "r1", encode_update(&update));

        manager.apply_from_bus(envelope).await;

        assert_eq!(manager.room_count().await, 1);
        assert_eq!(metrics.updates_total.get(), 1);
    }

    #[tokio::test]
    async fn test_malformed_bus_update_is_dropped() {
        let (manager, metrics) = test_manager();
        let envelope = BusEnvelope::new("instance-2", "r1", "@@not-base64@@");

        manager.apply_from_bus(envelope).await;
        assert_eq!(metrics.updates_total.get(), 0);
    }

    #[tokio::test]
    async fn test_bus_updates_are_not_republished() {
        let transport = Arc::new(MemoryTransport::new());
        let mut bus_rx = transport.subscribe_pattern("room:*").await.unwrap();
        let (manager, _) = manager_on(transport, "instance-1", Duration::from_secs(60));

        let update = text_update(&yrs::Doc::new(), 0, "x");
        let envelope = BusEnvelope::new("instance-2", "r1", encode_update(&update));
        manager.apply_from_bus(envelope).await;

        sleep(Duration::from_millis(100)).await;
        assert!(bus_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bus_warmed_room_is_eventually_evicted() {
        let (manager, _) = manager_on(
            Arc::new(MemoryTransport::new()),
            "instance-1",
            Duration::from_millis(50),
        );

        let update = text_update(&yrs::Doc::new(), 0, "warm");
        let envelope = BusEnvelope::new("instance-2", "r1", encode_update(&update));
        manager.apply_from_bus(envelope).await;
        assert_eq!(manager.room_count().await, 1);

        timeout(Duration::from_secs(2), async {
            while manager.room_count().await > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("warm room with no local clients should be evicted");
    }

    #[tokio::test]
    async fn test_eviction_persists_and_removes_idle_room() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, metrics) =
            manager_on(transport.clone(), "instance-1", Duration::from_millis(50));

        manager.ensure_room("r1").await;
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.attach("r1", conn, Peer::new("c1", tx)).await.unwrap();
        manager.detach("r1", conn).await;

        timeout(Duration::from_secs(2), async {
            while manager.room_count().await > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room should be evicted within the grace period");

        assert_eq!(metrics.active_rooms.get(), 0);
        assert!(transport.kv_value("room:r1:state").is_some());
    }

    #[tokio::test]
    async fn test_reattach_cancels_eviction() {
        let (manager, _) = manager_on(
            Arc::new(MemoryTransport::new()),
            "instance-1",
            Duration::from_millis(50),
        );

        manager.ensure_room("r1").await;
        let conn = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.attach("r1", conn, Peer::new("c1", tx)).await.unwrap();
        manager.detach("r1", conn).await;

        // Reattach inside the grace period keeps the room alive.
        let conn2 = Uuid::new_v4();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        manager.ensure_room("r1").await;
        manager.attach("r1", conn2, Peer::new("c2", tx2)).await.unwrap();

        sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_persist_by_id_writes_snapshot() {
        let transport = Arc::new(MemoryTransport::new());
        let (manager, _) = manager_on(transport.clone(), "instance-1", Duration::from_secs(60));

        manager.persist("ghost").await;
        assert!(transport.kv_value("room:ghost:state").is_none());

        manager.ensure_room("r1").await;
        manager.persist("r1").await;
        assert!(transport.kv_value("room:r1:state").is_some());
    }

    #[tokio::test]
    async fn test_ensure_room_loads_persisted_snapshot() {
        let transport = Arc::new(MemoryTransport::new());
        let (first, _) = manager_on(transport.clone(), "instance-1", Duration::from_secs(60));

        let room = first.ensure_room("r1").await;
        let update = text_update(&yrs::Doc::new(), 0, "persisted");
        first.apply_local(&room, Uuid::new_v4(), update).await;

        // A fresh manager over the same KV store sees the state.
        let (second, _) = manager_on(transport, "instance-2", Duration::from_secs(60));
        let restored = second.ensure_room("r1").await;
        assert_eq!(restored.encode_state().await, room.encode_state().await);
    }

    #[tokio::test]
    async fn test_ensure_room_survives_corrupt_snapshot() {
        let transport = Arc::new(MemoryTransport::new());
        transport
            .set("room:r1:state", "!!corrupt!!".to_string())
            .await
            .unwrap();

        let (manager, _) = manager_on(transport, "instance-1", Duration::from_secs(60));
        let room = manager.ensure_room("r1").await;
        // Room starts empty rather than failing the join.
        assert_eq!(manager.room_count().await, 1);
        assert!(room.encode_state().await.len() <= 2);
    }
}
