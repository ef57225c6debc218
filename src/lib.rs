//! # collab-relay — room-oriented CRDT synchronization relay
//!
//! Clients connect over WebSocket, join a named room, and exchange opaque
//! CRDT update blobs that converge on a single logical document per room.
//! Multiple relay instances cooperate through an external pub/sub bus so
//! that clients attached to different instances observe the same state.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                          ┌── Client C (instance 2)
//!             ├── Room ── Yrs Doc        │
//! Client B ──┘      │                    │
//!                   ├── local fan-out ───┘ (via bus)
//!                   │
//!          ┌────────┼────────────┐
//!          ▼        ▼            ▼
//!      snapshot   bus publish  local peers
//!      (KV SET)   (room:{id})  (sync/update)
//! ```
//!
//! ## Modules
//!
//! - [`crdt`] — thin seam over the Yrs CRDT library
//! - [`protocol`] — JSON wire frames and the bus envelope
//! - [`bus`] — pub/sub and key-value adapters (Redis, in-memory)
//! - [`store`] — room snapshot persistence over the KV adapter
//! - [`room`] / [`rooms`] — per-room state and the room lifecycle manager
//! - [`server`] — WebSocket connection handling plus `/health` and `/metrics`
//! - [`metrics`] — the four Prometheus series the relay exports
//!
//! ## Note for client authors
//!
//! A client that connects while an update is in flight may receive the
//! join snapshot first and then the same update again as a `sync/update`
//! frame. CRDT apply is idempotent, so the resulting state is correct;
//! clients must not treat the duplicate as an error.

pub mod bus;
pub mod config;
pub mod crdt;
pub mod metrics;
pub mod protocol;
pub mod room;
pub mod rooms;
pub mod server;
pub mod store;

pub use bus::{Bus, BusError, BusFrame, KvStore, MemoryTransport, RedisTransport};
pub use config::RelayConfig;
pub use crdt::{CrdtError, Document};
pub use metrics::Metrics;
pub use protocol::{BusEnvelope, ClientFrame, ProtocolError, SyncFrame};
pub use room::{ConnId, Peer, Room};
pub use rooms::RoomManager;
pub use server::RelayServer;
pub use store::{SnapshotStore, StoreError};
