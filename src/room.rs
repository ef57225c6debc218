//! Per-room state: the replicated document, the locally attached sockets,
//! and the eviction timer handle.
//!
//! A room's document is the per-room critical section. Fan-out happens
//! inside it so that the order updates are applied is the order local
//! peers observe them; the sends themselves are pushes onto unbounded
//! per-socket queues and never block, which keeps one room's slow client
//! from stalling anything else.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::crdt::{CrdtError, Document};
use crate::protocol::SyncFrame;

/// Identifies one attached socket. Distinct from the client id, which is
/// caller-supplied and only informational.
pub type ConnId = Uuid;

/// An attached client socket: identity plus its outbound queue.
#[derive(Clone)]
pub struct Peer {
    pub client_id: String,
    sender: mpsc::UnboundedSender<String>,
}

impl Peer {
    pub fn new(client_id: impl Into<String>, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            client_id: client_id.into(),
            sender,
        }
    }

    /// Queue a frame for this socket. Returns false once the socket's
    /// receive half is gone, which marks it for removal.
    fn send(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }
}

/// One active room.
pub struct Room {
    pub id: String,
    doc: Mutex<Document>,
    peers: RwLock<HashMap<ConnId, Peer>>,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_doc(id, Document::new())
    }

    /// Create a room around an already-initialized document (snapshot
    /// loaded by the manager).
    pub fn with_doc(id: impl Into<String>, doc: Document) -> Self {
        Self {
            id: id.into(),
            doc: Mutex::new(doc),
            peers: RwLock::new(HashMap::new()),
            eviction: Mutex::new(None),
        }
    }

    /// Apply an update and fan it out to attached peers in one critical
    /// section, so apply order equals broadcast order. Returns the number
    /// of frames queued.
    ///
    /// `exclude` skips the originating socket for locally received
    /// updates; bus-originated updates broadcast to everyone.
    pub async fn apply_and_broadcast(
        &self,
        bytes: &[u8],
        frame: &SyncFrame,
        exclude: Option<ConnId>,
    ) -> Result<usize, CrdtError> {
        let doc = self.doc.lock().await;
        doc.apply_update(bytes)?;
        Ok(self.send_to_peers(frame, exclude).await)
    }

    /// Queue a frame on every attached peer except `exclude`, dropping
    /// peers whose sockets are gone.
    pub async fn send_to_peers(&self, frame: &SyncFrame, exclude: Option<ConnId>) -> usize {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("failed to encode sync frame for room {}: {e}", self.id);
                return 0;
            }
        };

        let mut sent = 0;
        let mut dead = Vec::new();
        {
            let peers = self.peers.read().await;
            for (conn, peer) in peers.iter() {
                if Some(*conn) == exclude {
                    continue;
                }
                if peer.send(text.clone()) {
                    sent += 1;
                } else {
                    dead.push(*conn);
                }
            }
        }
        if !dead.is_empty() {
            let mut peers = self.peers.write().await;
            for conn in dead {
                if let Some(peer) = peers.remove(&conn) {
                    log::warn!(
                        "dropping unreachable socket for client {} in room {}",
                        peer.client_id,
                        self.id
                    );
                }
            }
        }
        sent
    }

    /// Encode the document's full state.
    pub async fn encode_state(&self) -> Vec<u8> {
        self.doc.lock().await.encode_state()
    }

    pub async fn attach(&self, conn: ConnId, peer: Peer) {
        self.peers.write().await.insert(conn, peer);
    }

    /// Remove a socket; returns how many remain.
    pub async fn detach(&self, conn: ConnId) -> usize {
        let mut peers = self.peers.write().await;
        peers.remove(&conn);
        peers.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Arm the eviction timer, replacing (and cancelling) any previous one.
    pub async fn set_eviction(&self, handle: JoinHandle<()>) {
        let mut slot = self.eviction.lock().await;
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Cancel a pending eviction. Idempotent.
    pub async fn cancel_eviction(&self) {
        if let Some(handle) = self.eviction.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_update;
    use yrs::{Text, Transact};

    fn sample_update() -> Vec<u8> {
        let doc = yrs::Doc::new();
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "hi");
        txn.encode_update_v1()
    }

    #[tokio::test]
    async fn test_attach_detach_counts() {
        let room = Room::new("r1");
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();

        room.attach(conn, Peer::new("c1", tx)).await;
        assert_eq!(room.peer_count().await, 1);

        assert_eq!(room.detach(conn).await, 0);
        assert_eq!(room.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator() {
        let room = Room::new("r1");
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let origin = Uuid::new_v4();
        let other = Uuid::new_v4();
        room.attach(origin, Peer::new("c1", tx1)).await;
        room.attach(other, Peer::new("c2", tx2)).await;

        let update = sample_update();
        let frame = SyncFrame::update(crate::protocol::encode_update(&update), "i1");
        let sent = room
            .apply_and_broadcast(&update, &frame, Some(origin))
            .await
            .unwrap();

        assert_eq!(sent, 1);
        let received = rx2.try_recv().unwrap();
        let decoded = SyncFrame::decode(&received).unwrap();
        assert_eq!(decode_update(&decoded.update).unwrap(), update);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_drops_closed_sockets() {
        let room = Room::new("r1");
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        drop(rx_dead);
        room.attach(Uuid::new_v4(), Peer::new("live", tx_live)).await;
        room.attach(Uuid::new_v4(), Peer::new("dead", tx_dead)).await;

        let update = sample_update();
        let frame = SyncFrame::update(crate::protocol::encode_update(&update), "i1");
        let sent = room.apply_and_broadcast(&update, &frame, None).await.unwrap();

        assert_eq!(sent, 1);
        assert!(rx_live.try_recv().is_ok());
        assert_eq!(room.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_update_leaves_peers_unnotified() {
        let room = Room::new("r1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        room.attach(Uuid::new_v4(), Peer::new("c1", tx)).await;

        let frame = SyncFrame::update("garbage", "i1");
        let result = room.apply_and_broadcast(&[0xFF], &frame, None).await;

        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_eviction_is_idempotent() {
        let room = Room::new("r1");
        room.cancel_eviction().await;

        let handle = tokio::spawn(async {
            tokio::time::sleep(tokio::time::Duration::from_secs(3600)).await;
        });
        room.set_eviction(handle).await;
        room.cancel_eviction().await;
        room.cancel_eviction().await;
    }
}
