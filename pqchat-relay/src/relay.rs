//! Relay server core: shared state, WebSocket handling, frame routing, and
//! room broadcasts.
//!
//! The relay accepts WebSocket connections speaking the `pqchat`
//! sub-protocol, registers clients by their self-asserted id, tracks room
//! membership, and routes opaque payloads between clients. It never
//! interprets key material or encrypted bodies; it only reads routing
//! metadata.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use pqchat_proto::frame::{self, ClientFrame, MessageEntry, RoomUser, ServerFrame};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::monitor;
use crate::registry::{ClientRecord, ConnId, ConnectionRegistry};
use crate::rooms::RoomDirectory;

/// Sub-protocol token negotiated on every WebSocket upgrade.
pub const SUB_PROTOCOL: &str = "pqchat";

/// Default interval between liveness probes.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between eviction sweeps.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Shared relay state: connection registry, room directory, and the liveness
/// monitor's timing knobs.
///
/// Constructed once at process start and threaded into every connection
/// handler and the monitor task.
pub struct RelayState {
    /// Authoritative map of open connections to client records.
    pub registry: ConnectionRegistry,
    /// Room id to member-id sets.
    pub rooms: RoomDirectory,
    /// How often liveness probes are sent.
    pub probe_interval: Duration,
    /// How often unanswered probes are checked for eviction.
    pub check_interval: Duration,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates relay state with default liveness intervals.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomDirectory::new(),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Creates relay state with intervals taken from a resolved
    /// [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomDirectory::new(),
            probe_interval: Duration::from_secs(config.probe_interval_secs),
            check_interval: Duration::from_secs(config.check_interval_secs),
        }
    }
}

/// Handles one upgraded WebSocket connection for its whole lifetime.
///
/// Lifecycle:
/// 1. Track the connection in the registry (liveness monitoring starts now).
/// 2. Spawn a writer task fed by the connection's outbound channel.
/// 3. Read frames in arrival order, dispatching each through the router.
/// 4. On close, error, or eviction, run the disconnect cleanup exactly once.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.registry.connect(tx).await;
    tracing::info!(conn_id, "connection opened");

    // Writer task: forwards channel messages to the socket. Ends when the
    // registry entry (the last sender clone) is dropped or a write fails.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn_id, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader loop: one frame per inbound event, processed in arrival order.
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_frame(conn_id, text.as_str(), &reader_state).await;
                }
                Message::Pong(_) => {
                    tracing::trace!(conn_id, "probe answered");
                    reader_state.registry.mark_responsive(conn_id).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn_id, "received close frame");
                    break;
                }
                _ => {
                    // Binary and ping frames carry nothing in this protocol.
                }
            }
        }
    });

    // Wait for either side to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    disconnect_cleanup(&state, conn_id).await;
    tracing::info!(conn_id, "connection closed");
}

/// Parses and dispatches a single inbound frame.
///
/// A frame that fails to parse produces one `error` reply and nothing else;
/// the connection stays open. Handler failures never tear down the
/// connection or the process.
pub(crate) async fn handle_frame(conn_id: ConnId, text: &str, state: &Arc<RelayState>) {
    let frame = match frame::decode_client(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(conn_id, error = %e, "failed to parse frame");
            let reply = ServerFrame::Error {
                message: format!("Failed to process message: {e}"),
            };
            send_to_conn(state, conn_id, &reply).await;
            return;
        }
    };

    match frame {
        ClientFrame::Register {
            client_id,
            kyber_public_key,
        } => handle_register(conn_id, client_id, kyber_public_key, state).await,
        ClientFrame::JoinRoom {
            room_id,
            auth_token,
        } => handle_join_room(conn_id, room_id, auth_token.as_deref(), state).await,
        ClientFrame::KeyExchange {
            recipient_id,
            public_key,
        } => handle_key_exchange(conn_id, &recipient_id, public_key, state).await,
        ClientFrame::Message {
            room_id,
            messages,
            timestamp,
        } => handle_message(conn_id, room_id.as_deref(), messages, &timestamp, state).await,
    }
}

/// Creates or overwrites the client record for this connection and confirms
/// the resolved id to the sender.
async fn handle_register(
    conn_id: ConnId,
    requested_id: Option<String>,
    public_key: Vec<u8>,
    state: &Arc<RelayState>,
) {
    let Some(client_id) = state
        .registry
        .register(conn_id, requested_id, public_key)
        .await
    else {
        return;
    };
    tracing::info!(conn_id, client_id = %client_id, "client registered");
    send_to_conn(state, conn_id, &ServerFrame::Registered { client_id }).await;
}

/// Moves the sender into the target room and announces the membership
/// change.
///
/// Any previous membership is left first (with a `user_left` notice to that
/// room). The sender gets `room_joined` with the full post-join member list;
/// the rest of the target room gets `user_joined`. Room auth is the
/// documented weak check: any non-empty token passes.
async fn handle_join_room(
    conn_id: ConnId,
    room_id: String,
    auth_token: Option<&str>,
    state: &Arc<RelayState>,
) {
    let Some(record) = require_registered(state, conn_id).await else {
        return;
    };

    if !auth_token.is_some_and(|token| !token.is_empty()) {
        let reply = ServerFrame::Error {
            message: "Invalid room password".to_string(),
        };
        send_to_conn(state, conn_id, &reply).await;
        return;
    }

    if let Some(prev_room) = &record.current_room {
        state.rooms.leave(prev_room, &record.id).await;
        let notice = ServerFrame::UserLeft {
            user_id: record.id.clone(),
        };
        broadcast_to_room(state, prev_room, &notice, Some(conn_id)).await;
    }

    state.rooms.join(&room_id, &record.id).await;
    state.registry.set_room(conn_id, Some(room_id.clone())).await;
    tracing::info!(conn_id, client_id = %record.id, room_id = %room_id, "client joined room");

    // Member list after the join, ids resolved to key material; ids whose
    // record vanished mid-flight are omitted rather than treated as errors.
    let member_ids = state.rooms.members_of(&room_id).await;
    let users = state
        .registry
        .public_keys_for(&member_ids)
        .await
        .into_iter()
        .map(|(id, public_key)| RoomUser { id, public_key })
        .collect();
    let confirm = ServerFrame::RoomJoined {
        room_id: room_id.clone(),
        users,
    };
    send_to_conn(state, conn_id, &confirm).await;

    let notice = ServerFrame::UserJoined {
        user_id: record.id,
        public_key: record.public_key,
    };
    broadcast_to_room(state, &room_id, &notice, Some(conn_id)).await;
}

/// Forwards key-encapsulation material to the named recipient.
///
/// An unknown recipient is a silent drop: no error goes back to the sender,
/// so presence is not leaked.
async fn handle_key_exchange(
    conn_id: ConnId,
    recipient_id: &str,
    public_key: Vec<u8>,
    state: &Arc<RelayState>,
) {
    let Some(record) = require_registered(state, conn_id).await else {
        return;
    };

    if let Some(sender) = state.registry.sender_for_id(recipient_id).await {
        tracing::debug!(
            from = %record.id,
            to = %recipient_id,
            "forwarding key exchange"
        );
        let forward = ServerFrame::KeyExchange {
            sender_id: record.id,
            public_key,
        };
        send_on(&sender, &forward);
    } else {
        tracing::debug!(
            from = %record.id,
            to = %recipient_id,
            "key exchange recipient not found, dropping"
        );
    }
}

/// Routes a batch of per-recipient encrypted payloads point-to-point.
///
/// A recipient id equal to the sender's own id is skipped outright; a
/// sender must never receive its own outbound message back. Unmatched
/// recipients are silently dropped.
async fn handle_message(
    conn_id: ConnId,
    room_id: Option<&str>,
    messages: Vec<MessageEntry>,
    timestamp: &Value,
    state: &Arc<RelayState>,
) {
    let Some(record) = require_registered(state, conn_id).await else {
        return;
    };

    tracing::debug!(
        conn_id,
        client_id = %record.id,
        room_id = room_id.unwrap_or("-"),
        recipients = messages.len(),
        "routing message batch"
    );

    for entry in messages {
        if entry.recipient_id == record.id {
            continue;
        }
        let Some(sender) = state.registry.sender_for_id(&entry.recipient_id).await else {
            tracing::debug!(
                from = %record.id,
                to = %entry.recipient_id,
                "message recipient not found, dropping"
            );
            continue;
        };
        let forward = ServerFrame::Message {
            sender_id: record.id.clone(),
            encrypted_data: entry.encrypted_data,
            timestamp: timestamp.clone(),
            public_key: record.public_key.clone(),
        };
        send_on(&sender, &forward);
    }
}

/// Removes a connection from the registry and the room directory,
/// broadcasting the departure to the remaining members.
///
/// Shared by the explicit-disconnect path and liveness eviction; safe to
/// call more than once per connection.
pub(crate) async fn disconnect_cleanup(state: &Arc<RelayState>, conn_id: ConnId) {
    let Some(entry) = state.registry.remove(conn_id).await else {
        return;
    };
    let Some(record) = entry.record else {
        return;
    };
    if let Some(room_id) = record.current_room {
        state.rooms.leave(&room_id, &record.id).await;
        tracing::info!(conn_id, client_id = %record.id, room_id = %room_id, "client left room");
        let notice = ServerFrame::UserLeft {
            user_id: record.id,
        };
        broadcast_to_room(state, &room_id, &notice, None).await;
    }
}

/// Delivers a frame to every open connection currently in the room, except
/// at most one.
///
/// The audience comes from a connection-driven registry scan, so a stale
/// room member whose connection is gone is simply not in the list.
pub(crate) async fn broadcast_to_room(
    state: &Arc<RelayState>,
    room_id: &str,
    frame: &ServerFrame,
    exclude: Option<ConnId>,
) {
    let text = match frame::encode_server(frame) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode broadcast frame");
            return;
        }
    };
    for sender in state.registry.senders_in_room(room_id, exclude).await {
        let _ = sender.send(Message::Text(text.clone().into()));
    }
}

/// Fetches the sender's record, replying `error "Not registered"` when the
/// connection has not registered yet.
async fn require_registered(state: &Arc<RelayState>, conn_id: ConnId) -> Option<ClientRecord> {
    let record = state.registry.record(conn_id).await;
    if record.is_none() {
        tracing::warn!(conn_id, "frame from unregistered connection");
        let reply = ServerFrame::Error {
            message: "Not registered".to_string(),
        };
        send_to_conn(state, conn_id, &reply).await;
    }
    record
}

/// Sends a frame to a specific connection, if it is still open.
async fn send_to_conn(state: &Arc<RelayState>, conn_id: ConnId, frame: &ServerFrame) {
    if let Some(sender) = state.registry.sender_for_conn(conn_id).await {
        send_on(&sender, frame);
    }
}

/// Encodes a frame onto a connection's outbound channel.
///
/// Best-effort: a full or closed channel is the liveness monitor's problem,
/// never the router's.
fn send_on(sender: &mpsc::UnboundedSender<Message>, frame: &ServerFrame) {
    if let Ok(text) = frame::encode_server(frame) {
        let _ = sender.send(Message::Text(text.into()));
    }
}

/// Room provisioning request body for `POST /api/rooms`.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CreateRoomRequest {
    room_id: String,
    password: String,
}

/// Housekeeping endpoint that validates a room provisioning request.
///
/// Rooms are created implicitly on first join; this endpoint only checks
/// the request shape and echoes success, matching the original deployment's
/// behavior.
async fn create_room(Json(req): Json<CreateRoomRequest>) -> impl IntoResponse {
    if req.room_id.is_empty() || req.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Room ID and password are required"})),
        );
    }
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "roomId": req.room_id})),
    )
}

/// Starts the relay server on the given address with default state.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`], spawning
/// the liveness monitor alongside it.
///
/// Returns the bound address and a join handle for the server task. This is
/// the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .route("/api/rooms", axum::routing::post(create_room))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    tokio::spawn(monitor::run(state));

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection,
/// negotiating the fixed sub-protocol.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.protocols([SUB_PROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, state))
}
