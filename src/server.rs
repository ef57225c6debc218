//! WebSocket connection handling and the HTTP surface.
//!
//! One listener serves three routes: `GET /` upgrades to a WebSocket and
//! joins the room named in the query string, `GET /health` reports
//! liveness, and `GET /metrics` exposes the Prometheus series.
//!
//! Handshake contract: `/?room=<roomId>[&clientId=<clientId>]`. A missing
//! `room` closes the socket with policy-violation 1008; any other
//! handshake-phase failure closes with internal-error 1011.

use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::bus::{Bus, KvStore};
use crate::config::RelayConfig;
use crate::metrics::Metrics;
use crate::protocol::{decode_update, encode_update, ClientFrame, SyncFrame};
use crate::room::{ConnId, Peer, Room};
use crate::rooms::RoomManager;
use crate::store::SnapshotStore;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<RoomManager>,
    pub metrics: Arc<Metrics>,
    pub instance_id: String,
}

/// The relay: room manager, metrics, and the listener glue.
pub struct RelayServer {
    config: RelayConfig,
    bus: Arc<dyn Bus>,
    manager: Arc<RoomManager>,
    metrics: Arc<Metrics>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, bus: Arc<dyn Bus>, kv: Arc<dyn KvStore>) -> Self {
        let metrics = Arc::new(Metrics::new());
        let manager = RoomManager::new(
            SnapshotStore::new(kv),
            bus.clone(),
            metrics.clone(),
            config.instance_id.clone(),
            config.eviction_grace,
        );
        Self {
            config,
            bus,
            manager,
            metrics,
        }
    }

    pub fn manager(&self) -> Arc<RoomManager> {
        self.manager.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    ///
    /// Startup subscribes to the bus pattern `room:*` and spawns the
    /// ingress task. Shutdown persists every resident room before the
    /// listener closes; in-flight sockets are dropped with it.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ingress = self.bus.subscribe_pattern("room:*").await?;
        tokio::spawn(self.manager.clone().run_bus_ingress(ingress));

        let state = AppState {
            manager: self.manager.clone(),
            metrics: self.metrics.clone(),
            instance_id: self.config.instance_id.clone(),
        };
        let app = router(state);

        tokio::select! {
            result = axum::serve(listener, app).into_future() => result?,
            () = shutdown => {
                log::info!("shutting down, persisting rooms");
                self.manager.persist_all().await;
            }
        }
        Ok(())
    }
}

/// Build the route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics_exposition))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    axum::Json(serde_json::json!({
        "status": "ok",
        "instanceId": state.instance_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

async fn metrics_exposition(State(state): State<AppState>) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let room = params.get("room").cloned();
    let client_id = params.get("clientId").cloned();
    ws.on_upgrade(move |socket| handle_socket(state, socket, room, client_id))
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Drive one client socket from handshake to close.
async fn handle_socket(
    state: AppState,
    mut socket: WebSocket,
    room_param: Option<String>,
    client_id: Option<String>,
) {
    let Some(room_id) = room_param.filter(|room| !room.is_empty()) else {
        close_with(&mut socket, close_code::POLICY, "room parameter is required").await;
        return;
    };
    let client_id = client_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    let conn: ConnId = Uuid::new_v4();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    // ensure + attach can race with an eviction firing in between; on
    // a miss the room is simply ensured again.
    let room: Arc<Room> = loop {
        state.manager.ensure_room(&room_id).await;
        if let Some(room) = state
            .manager
            .attach(&room_id, conn, Peer::new(client_id.clone(), outbound_tx.clone()))
            .await
        {
            break room;
        }
    };

    // Initial full-state snapshot. A concurrent update may also arrive as
    // a sync/update frame; idempotent apply makes the duplicate harmless.
    let snapshot = SyncFrame::snapshot(encode_update(&room.encode_state().await));
    let sent = match snapshot.encode() {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            log::error!("room {room_id}: failed to encode snapshot: {e}");
            close_with(&mut socket, close_code::ERROR, "internal error").await;
            state.manager.detach(&room_id, conn).await;
            return;
        }
    };
    if !sent {
        state.manager.detach(&room_id, conn).await;
        return;
    }
    state.metrics.messages_sent_total.inc();
    log::info!("client {client_id} joined room {room_id}");

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        let frame = match ClientFrame::decode(&raw) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("client {client_id}: dropping malformed frame: {e}");
                                continue;
                            }
                        };
                        // Routing uses the room bound at handshake; the
                        // frame's room field is informational.
                        if frame.kind != "update" {
                            continue;
                        }
                        let Some(update) = frame.update.filter(|update| !update.is_empty()) else {
                            continue;
                        };
                        let bytes = match decode_update(&update) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                log::warn!("client {client_id}: dropping update: {e}");
                                continue;
                            }
                        };
                        state.manager.apply_local(&room, conn, bytes).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("client {client_id}: socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.manager.detach(&room_id, conn).await;
    log::info!("client {client_id} left room {room_id}");
}
