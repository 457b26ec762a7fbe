//! WebSocket handler — coordination frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by op prefix
//! - Broadcast frames from room peers → forward to client
//!
//! Handler functions validate, call into the services, and return an
//! `Outcome`. The dispatch layer owns all outbound concerns: reply to
//! sender and broadcast to peers.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. `room:join` registers the presence connection and the room sender
//! 3. `presence:beat` keeps the connection alive (plus a throttled
//!    write-through into `players.last_seen`)
//! 4. Close without `room:leave` → mark offline, wait out the grace
//!    window, re-check presence and heartbeat, then commit the leave

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame, now_ms};
use crate::services::election::HostDecision;
use crate::services::lobby;
use crate::services::room::{self, LeaveSummary};
use crate::state::{AppState, RoomClients};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what — handlers never send frames directly.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// No reply at all (heartbeats).
    Silent,
    /// Reply to sender, broadcast different data to peers under `op`.
    ReplyAndBroadcast { reply: Data, op: &'static str, broadcast: Data },
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(uid) = params.get("uid").cloned() else {
        return (StatusCode::BAD_REQUEST, "uid required").into_response();
    };
    if uid.is_empty() {
        return (StatusCode::BAD_REQUEST, "uid required").into_response();
    }
    let name = params
        .get("name")
        .cloned()
        .unwrap_or_else(|| "anonymous".to_string());

    ws.on_upgrade(move |socket| run_ws(socket, state, uid, name))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, uid: String, name: String) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving broadcast frames from peers.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", uid.clone());
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, uid, "ws: client connected");

    // The room this connection has joined, if any.
    let mut current_room: Option<String> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut current_room, client_id, &uid, &name, &client_tx, &text).await;
                        for frame in replies {
                            if send_frame(&mut socket, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // A vanished socket is not a leave: flag the connection offline and
    // let the grace window decide.
    if let Some(room_id) = current_room.take() {
        remove_client(&state, &room_id, client_id).await;
        state.presence.mark_offline(&room_id, &uid, client_id);
        spawn_grace_leave(state.clone(), room_id, uid.clone(), client_id);
    }
    info!(%client_id, uid, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the
/// sender. Transport stays out of here so tests can drive dispatch
/// directly.
async fn process_inbound_text(
    state: &AppState,
    current_room: &mut Option<String>,
    client_id: Uuid,
    uid: &str,
    name: &str,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    req.from = Some(uid.to_string());

    let prefix = req.prefix();
    let is_beat = prefix == "presence";
    if !is_beat {
        info!(%client_id, id = %req.id, op = %req.op, "ws: recv frame");
    }

    let result = match prefix {
        "room" => handle_room(state, current_room, client_id, uid, name, client_tx, &req).await,
        "presence" => Ok(handle_presence(state, current_room.as_deref(), client_id, uid, &req)),
        "lobby" => handle_lobby(state, current_room.as_deref(), uid, &req).await,
        _ => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    let room_id = current_room.clone();
    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Ok(Outcome::ReplyAndBroadcast { reply, op, broadcast }) => {
            if let Some(room_id) = room_id {
                let notif = Frame::request(op, broadcast).with_room_id(room_id.clone());
                room::broadcast(state, &room_id, &notif, Some(client_id)).await;
            }
            vec![req.done_with(reply)]
        }
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(
    state: &AppState,
    current_room: &mut Option<String>,
    client_id: Uuid,
    uid: &str,
    name: &str,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let op = req.op.split_once(':').map_or("", |(_, op)| op);

    match op {
        "create" => {
            let Some(room_id) = requested_room_id(req) else {
                return Err(req.error("room_id required"));
            };
            match room::create_room(state, &room_id, uid, name).await {
                Ok(()) => {
                    let mut data = Data::new();
                    data.insert("room_id".into(), serde_json::json!(room_id));
                    Ok(Outcome::Reply(data))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "join" => {
            let Some(room_id) = requested_room_id(req) else {
                return Err(req.error("room_id required"));
            };

            // Joining elsewhere means leaving here, cleanly and now.
            if let Some(old_room) = current_room.take() {
                if old_room != room_id {
                    depart(state, &old_room, uid, client_id).await;
                } else {
                    *current_room = Some(old_room);
                }
            }

            let display_name = req
                .data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(name);
            let avatar = req
                .data
                .get("avatar")
                .and_then(|v| v.as_str())
                .map(String::from);

            match room::join_room(state, &room_id, uid, display_name, avatar).await {
                Ok(summary) => {
                    state.presence.connect(&room_id, uid, client_id);
                    {
                        let mut rooms = state.rooms.write().await;
                        rooms
                            .entry(room_id.clone())
                            .or_insert_with(RoomClients::default)
                            .clients
                            .insert(client_id, client_tx.clone());
                    }
                    *current_room = Some(room_id.clone());

                    let reply = match room::room_projection(state, &room_id).await {
                        Ok(projection) => projection,
                        Err(e) => {
                            warn!(error = %e, room_id, "projection after join failed");
                            let mut data = Data::new();
                            data.insert("host_id".into(), serde_json::json!(summary.host_id));
                            data
                        }
                    };

                    let mut broadcast = Data::new();
                    broadcast.insert("uid".into(), serde_json::json!(uid));
                    broadcast.insert("name".into(), serde_json::json!(display_name));
                    broadcast.insert("rejoined".into(), serde_json::json!(summary.rejoined));

                    Ok(Outcome::ReplyAndBroadcast { reply, op: "room:join", broadcast })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "leave" => {
            let Some(room_id) = current_room.take() else {
                return Err(req.error("not in a room"));
            };
            depart(state, &room_id, uid, client_id).await;
            Ok(Outcome::Done)
        }
        "state" => {
            let Some(room_id) = requested_room_id(req).or_else(|| current_room.clone()) else {
                return Err(req.error("room_id required"));
            };
            match room::room_projection(state, &room_id).await {
                Ok(projection) => Ok(Outcome::Reply(projection)),
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "claim-host" => {
            let Some(room_id) = current_room.clone() else {
                return Err(req.error("must join a room first"));
            };
            match room::claim_host(state, &room_id, uid).await {
                Ok(decision) => {
                    let mut reply = Data::new();
                    match &decision {
                        HostDecision::None => {
                            reply.insert("result".into(), serde_json::json!("none"));
                            Ok(Outcome::Reply(reply))
                        }
                        HostDecision::Assign { id, name, reason } => {
                            reply.insert("result".into(), serde_json::json!("assign"));
                            reply.insert("host_id".into(), serde_json::json!(id));
                            reply.insert("reason".into(), serde_json::json!(reason.as_str()));
                            let mut broadcast = Data::new();
                            broadcast.insert("host_id".into(), serde_json::json!(id));
                            broadcast.insert("host_name".into(), serde_json::json!(name));
                            broadcast.insert("reason".into(), serde_json::json!(reason.as_str()));
                            Ok(Outcome::ReplyAndBroadcast { reply, op: "room:host", broadcast })
                        }
                        HostDecision::Clear { reason } => {
                            reply.insert("result".into(), serde_json::json!("clear"));
                            reply.insert("reason".into(), serde_json::json!(reason.as_str()));
                            Ok(Outcome::Reply(reply))
                        }
                    }
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "transfer-host" => {
            let Some(room_id) = current_room.clone() else {
                return Err(req.error("must join a room first"));
            };
            let Some(target) = req.data.get("target").and_then(|v| v.as_str()) else {
                return Err(req.error("target required"));
            };
            let admin_override = req
                .data
                .get("admin")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            match room::transfer_host(state, &room_id, uid, target, admin_override).await {
                Ok(()) => {
                    let mut broadcast = Data::new();
                    broadcast.insert("host_id".into(), serde_json::json!(target));
                    broadcast.insert("reason".into(), serde_json::json!("transfer"));
                    Ok(Outcome::ReplyAndBroadcast { reply: Data::new(), op: "room:host", broadcast })
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "start" => {
            let Some(room_id) = current_room.clone() else {
                return Err(req.error("must join a room first"));
            };
            let request_id = req.data.get("request_id").and_then(|v| v.as_str());
            let topic = req.data.get("topic").and_then(|v| v.as_str());
            match room::start_round(state, &room_id, uid, request_id, topic).await {
                Ok(applied) => {
                    let mut reply = Data::new();
                    reply.insert("applied".into(), serde_json::json!(applied));
                    if applied {
                        let mut broadcast = Data::new();
                        broadcast.insert("by".into(), serde_json::json!(uid));
                        Ok(Outcome::ReplyAndBroadcast { reply, op: "room:start", broadcast })
                    } else {
                        Ok(Outcome::Reply(reply))
                    }
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "reset" => {
            let Some(room_id) = current_room.clone() else {
                return Err(req.error("must join a room first"));
            };
            let request_id = req.data.get("request_id").and_then(|v| v.as_str());
            match room::reset_room(state, &room_id, uid, request_id).await {
                Ok(applied) => {
                    let mut reply = Data::new();
                    reply.insert("applied".into(), serde_json::json!(applied));
                    if applied {
                        let mut broadcast = Data::new();
                        broadcast.insert("by".into(), serde_json::json!(uid));
                        Ok(Outcome::ReplyAndBroadcast { reply, op: "room:reset", broadcast })
                    } else {
                        Ok(Outcome::Reply(reply))
                    }
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        _ => Err(req.error(format!("unknown room op: {op}"))),
    }
}

fn requested_room_id(req: &Frame) -> Option<String> {
    req.room_id.clone().or_else(|| {
        req.data
            .get("room_id")
            .and_then(|v| v.as_str())
            .map(String::from)
    })
}

// =============================================================================
// PRESENCE HANDLER
// =============================================================================

fn handle_presence(
    state: &AppState,
    current_room: Option<&str>,
    client_id: Uuid,
    uid: &str,
    req: &Frame,
) -> Outcome {
    let Some(room_id) = current_room else {
        // Silently ignore beats before joining.
        return Outcome::Silent;
    };

    let ts = req
        .data
        .get("ts")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or_else(now_ms);

    state.presence.beat(room_id, uid, client_id, ts);
    room::touch_heartbeat(state, room_id, uid, ts);
    Outcome::Silent
}

// =============================================================================
// LOBBY HANDLER
// =============================================================================

async fn handle_lobby(
    state: &AppState,
    current_room: Option<&str>,
    uid: &str,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let op = req.op.split_once(':').map_or("", |(_, op)| op);
    match op {
        "count" => {
            let Some(room_id) = requested_room_id(req).or_else(|| current_room.map(String::from)) else {
                return Err(req.error("room_id required"));
            };
            let exclude_self = req
                .data
                .get("exclude_self")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            let exclude: Vec<&str> = if exclude_self { vec![uid] } else { Vec::new() };
            let count = lobby::reconciled_count(state, &room_id, &exclude).await;
            let mut data = Data::new();
            data.insert("count".into(), serde_json::json!(count));
            Ok(Outcome::Reply(data))
        }
        _ => Err(req.error(format!("unknown lobby op: {op}"))),
    }
}

// =============================================================================
// DEPARTURE
// =============================================================================

/// Shared clean-exit path: drop the client sender and the presence
/// record, settle the authoritative leave, and tell the peers what
/// changed.
async fn depart(state: &AppState, room_id: &str, uid: &str, client_id: Uuid) {
    remove_client(state, room_id, client_id).await;
    state.presence.disconnect(room_id, uid, client_id);
    match room::leave_room(state, room_id, uid).await {
        Ok(summary) => broadcast_leave_effects(state, room_id, uid, &summary).await,
        Err(e) => warn!(error = %e, room_id, uid, "leave failed"),
    }
}

async fn remove_client(state: &AppState, room_id: &str, client_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    if let Some(room) = rooms.get_mut(room_id) {
        room.clients.remove(&client_id);
        if room.clients.is_empty() {
            rooms.remove(room_id);
        }
    }
}

async fn broadcast_leave_effects(state: &AppState, room_id: &str, uid: &str, summary: &LeaveSummary) {
    if !summary.removed || summary.now_empty {
        return;
    }

    let mut data = Data::new();
    data.insert("uid".into(), serde_json::json!(uid));
    data.insert("name".into(), serde_json::json!(summary.player_name));
    let frame = Frame::request("room:leave", data).with_room_id(room_id);
    room::broadcast(state, room_id, &frame, None).await;

    if let HostDecision::Assign { id, name, reason } = &summary.host_decision {
        let mut data = Data::new();
        data.insert("host_id".into(), serde_json::json!(id));
        data.insert("host_name".into(), serde_json::json!(name));
        data.insert("reason".into(), serde_json::json!(reason.as_str()));
        let frame = Frame::request("room:host", data).with_room_id(room_id);
        room::broadcast(state, room_id, &frame, None).await;
    }

    if summary.transitioned_to_reveal {
        let frame = Frame::request("room:reveal", Data::new()).with_room_id(room_id);
        room::broadcast(state, room_id, &frame, None).await;
    }
}

/// Disconnect-vs-reconnect disambiguation: wait out the grace window,
/// then re-check both the ephemeral registry (a fresh connection) and the
/// store heartbeat (a write-through that landed mid-window) before
/// committing the leave. The wait is bounded and always ends in a real
/// state check.
fn spawn_grace_leave(state: AppState, room_id: String, uid: String, conn_id: Uuid) {
    tokio::spawn(async move {
        let disconnected_at = now_ms();
        tokio::time::sleep(Duration::from_millis(state.config.leave_grace_ms)).await;

        let now = now_ms();
        if state
            .presence
            .user_present(&room_id, &uid, now, &state.config.liveness)
        {
            // Reconnected in time: only the dead connection record goes.
            state.presence.disconnect(&room_id, &uid, conn_id);
            info!(room_id, uid, "grace leave canceled; user reconnected");
            return;
        }
        match room::heartbeat_since(&state.pool, &room_id, &uid, disconnected_at).await {
            Ok(true) => {
                state.presence.disconnect(&room_id, &uid, conn_id);
                info!(room_id, uid, "grace leave canceled; heartbeat landed");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, room_id, uid, "grace re-check failed; committing leave");
            }
        }

        state.presence.disconnect(&room_id, &uid, conn_id);
        match room::leave_room(&state, &room_id, &uid).await {
            Ok(summary) => broadcast_leave_effects(&state, &room_id, &uid, &summary).await,
            Err(e) => warn!(error = %e, room_id, uid, "grace leave failed"),
        }
    });
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
