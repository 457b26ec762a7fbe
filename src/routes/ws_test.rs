use super::*;
use crate::frame::Status;
use crate::services::election::DecisionReason;
use crate::state::test_helpers;

fn req(op: &str) -> Frame {
    Frame::request(op, Data::new())
}

async fn dispatch(
    state: &AppState,
    current_room: &mut Option<String>,
    client_id: Uuid,
    uid: &str,
    text: &str,
) -> Vec<Frame> {
    let (tx, _rx) = mpsc::channel(8);
    process_inbound_text(state, current_room, client_id, uid, uid, &tx, text).await
}

#[tokio::test]
async fn invalid_json_yields_gateway_error() {
    let state = test_helpers::test_app_state();
    let mut room = None;
    let replies = dispatch(&state, &mut room, Uuid::new_v4(), "u1", "{not json").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].op, "gateway:error");
}

#[tokio::test]
async fn unknown_prefix_yields_error_frame() {
    let state = test_helpers::test_app_state();
    let mut room = None;
    let text = serde_json::to_string(&req("mystery:op")).unwrap();
    let replies = dispatch(&state, &mut room, Uuid::new_v4(), "u1", &text).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, Status::Error);
}

#[tokio::test]
async fn beat_before_join_is_silent() {
    let state = test_helpers::test_app_state();
    let mut room = None;
    let text = serde_json::to_string(&req("presence:beat")).unwrap();
    let replies = dispatch(&state, &mut room, Uuid::new_v4(), "u1", &text).await;
    assert!(replies.is_empty());
    assert!(state.presence.room_ids().is_empty());
}

#[tokio::test]
async fn beat_lands_in_the_presence_registry() {
    let state = test_helpers::test_app_state();
    let mut room = Some("r1".to_string());
    let client_id = Uuid::new_v4();
    let now = now_ms();
    let frame = req("presence:beat").with_data("ts", now);
    let text = serde_json::to_string(&frame).unwrap();

    let replies = dispatch(&state, &mut room, client_id, "u1", &text).await;
    assert!(replies.is_empty());
    assert!(state.presence.user_present("r1", "u1", now, &state.config.liveness));
}

#[tokio::test]
async fn lobby_count_reflects_presence() {
    let state = test_helpers::test_app_state();
    let now = now_ms();
    state.presence.beat("r1", "u1", Uuid::new_v4(), now);
    state.presence.beat("r1", "u2", Uuid::new_v4(), now);

    let mut room = None;
    let frame = req("lobby:count").with_data("room_id", "r1");
    let text = serde_json::to_string(&frame).unwrap();
    let replies = dispatch(&state, &mut room, Uuid::new_v4(), "viewer", &text).await;

    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, Status::Done);
    assert_eq!(replies[0].data.get("count").and_then(serde_json::Value::as_u64), Some(2));
}

#[tokio::test]
async fn lobby_count_excludes_self_when_asked() {
    let state = test_helpers::test_app_state();
    let now = now_ms();
    state.presence.beat("r1", "viewer", Uuid::new_v4(), now);
    state.presence.beat("r1", "u2", Uuid::new_v4(), now);

    let mut room = Some("r1".to_string());
    let frame = req("lobby:count").with_data("exclude_self", true);
    let text = serde_json::to_string(&frame).unwrap();
    let replies = dispatch(&state, &mut room, Uuid::new_v4(), "viewer", &text).await;

    assert_eq!(replies[0].data.get("count").and_then(serde_json::Value::as_u64), Some(1));
}

#[tokio::test]
async fn leave_effects_reach_remaining_peers() {
    let state = test_helpers::test_app_state();
    let peer = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    {
        let mut rooms = state.rooms.write().await;
        rooms.entry("r1".to_string()).or_default().clients.insert(peer, tx);
    }

    let summary = LeaveSummary {
        removed: true,
        player_name: "G1".into(),
        transitioned_to_reveal: true,
        now_empty: false,
        host_decision: HostDecision::Assign {
            id: "g2".into(),
            name: "G2".into(),
            reason: DecisionReason::HostLeft,
        },
    };
    broadcast_leave_effects(&state, "r1", "g1", &summary).await;

    let leave = rx.recv().await.expect("leave frame");
    assert_eq!(leave.op, "room:leave");
    assert_eq!(leave.data.get("uid").and_then(|v| v.as_str()), Some("g1"));

    let host = rx.recv().await.expect("host frame");
    assert_eq!(host.op, "room:host");
    assert_eq!(host.data.get("host_id").and_then(|v| v.as_str()), Some("g2"));
    assert_eq!(host.data.get("reason").and_then(|v| v.as_str()), Some("host-left"));

    let reveal = rx.recv().await.expect("reveal frame");
    assert_eq!(reveal.op, "room:reveal");
}

#[tokio::test]
async fn empty_room_leave_broadcasts_nothing() {
    let state = test_helpers::test_app_state();
    let peer = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);
    {
        let mut rooms = state.rooms.write().await;
        rooms.entry("r1".to_string()).or_default().clients.insert(peer, tx);
    }

    let summary = LeaveSummary {
        removed: true,
        player_name: "last".into(),
        transitioned_to_reveal: false,
        now_empty: true,
        host_decision: HostDecision::Clear { reason: DecisionReason::NoPlayers },
    };
    broadcast_leave_effects(&state, "r1", "last", &summary).await;

    assert!(
        tokio::time::timeout(Duration::from_millis(80), rx.recv())
            .await
            .is_err(),
        "expected no broadcast for an emptied room"
    );
}

#[tokio::test]
async fn remove_client_evicts_empty_room_entries() {
    let state = test_helpers::test_app_state();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let (tx_a, _ra) = mpsc::channel(8);
    let (tx_b, _rb) = mpsc::channel(8);
    {
        let mut rooms = state.rooms.write().await;
        let entry = rooms.entry("r1".to_string()).or_default();
        entry.clients.insert(a, tx_a);
        entry.clients.insert(b, tx_b);
    }

    remove_client(&state, "r1", a).await;
    assert!(state.rooms.read().await.contains_key("r1"));
    remove_client(&state, "r1", b).await;
    assert!(!state.rooms.read().await.contains_key("r1"));
}

// =============================================================================
// END TO END
// =============================================================================

mod end_to_end {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn serve() -> (std::net::SocketAddr, AppState) {
        let state = test_helpers::test_app_state();
        let app = crate::routes::app(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    async fn next_frame<S>(stream: &mut S) -> Frame
    where
        S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
                .await
                .expect("frame receive timed out")
                .expect("stream ended")
                .expect("ws error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).expect("frame json");
            }
        }
    }

    #[tokio::test]
    async fn connect_then_count_over_the_wire() {
        let (addr, _state) = serve().await;
        let (mut ws, _) = connect_async(format!("ws://{addr}/api/ws?uid=u1&name=Ada"))
            .await
            .expect("ws connect");

        let welcome = next_frame(&mut ws).await;
        assert_eq!(welcome.op, "session:connected");
        assert_eq!(welcome.data.get("user_id").and_then(|v| v.as_str()), Some("u1"));

        let count_req = Frame::request("lobby:count", Data::new()).with_data("room_id", "ghost-town");
        ws.send(WsMessage::Text(serde_json::to_string(&count_req).unwrap().into()))
            .await
            .expect("send");

        let reply = next_frame(&mut ws).await;
        assert_eq!(reply.status, Status::Done);
        assert_eq!(reply.parent_id, Some(count_req.id));
        assert_eq!(reply.data.get("count").and_then(serde_json::Value::as_u64), Some(0));
    }

    #[tokio::test]
    async fn missing_uid_is_rejected_before_upgrade() {
        let (addr, _state) = serve().await;
        let result = connect_async(format!("ws://{addr}/api/ws")).await;
        assert!(result.is_err(), "upgrade should be refused without a uid");
    }
}
