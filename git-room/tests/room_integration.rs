//! End-to-end tests against a real server on a free port.
//!
//! Raw `tokio_tungstenite` sockets exercise the wire protocol directly;
//! `RoomClient` instances exercise the full client pipeline.

use futures_util::{SinkExt, StreamExt};
use git_room::client::{ConnectionState, RoomClient, RoomClientOptions};
use git_room::protocol::{ClientMessage, Participant, RawRoomState, ServerEvent};
use git_room::sanitize::sanitize_remote;
use git_room::server::{RoomServer, ServerConfig, ROOM_REQUIRED};
use std::sync::Arc;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server_on(port: u16) {
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = RoomServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    start_server_on(port).await;
    port
}

/// Serve from a listener bound here, keeping a handle on the server.
async fn start_shared_server() -> (Arc<RoomServer>, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(RoomServer::new(ServerConfig::default()));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, port)
}

async fn join_raw(port: u16, query: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/?{query}");
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    ws
}

/// Next `room:state`/`room:error` event, or `None` once the socket closes.
async fn next_event(ws: &mut Ws) -> Option<ServerEvent> {
    let read = async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(ServerEvent::decode(text.as_str()).unwrap());
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    };
    timeout(Duration::from_secs(2), read).await.expect("timed out waiting for frame")
}

async fn next_state(ws: &mut Ws) -> RawRoomState {
    match next_event(ws).await {
        Some(ServerEvent::State(state)) => state,
        other => panic!("expected room:state, got {other:?}"),
    }
}

async fn send_update(ws: &mut Ws, room: &str, participant: &Participant) {
    let frame = ClientMessage::update(room, participant).unwrap().encode().unwrap();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

fn ids(state: &RawRoomState) -> Vec<String> {
    sanitize_remote(&state.participants)
        .into_iter()
        .map(|p| p.id)
        .collect()
}

fn client_options(port: u16, room: &str, username: &str) -> RoomClientOptions {
    RoomClientOptions {
        server_url: format!("ws://127.0.0.1:{port}"),
        room_name: room.to_string(),
        username: username.to_string(),
        reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(100),
        ..RoomClientOptions::default()
    }
}

async fn wait_for_view(
    rx: &mut UnboundedReceiver<Vec<Participant>>,
    done: impl Fn(&[Participant]) -> bool,
) -> Vec<Participant> {
    let wait = async {
        while let Some(view) = rx.recv().await {
            if done(&view) {
                return view;
            }
        }
        panic!("view subscription closed");
    };
    timeout(Duration::from_secs(5), wait).await.expect("timed out waiting for view")
}

#[tokio::test]
async fn test_join_receives_initial_state() {
    let port = start_test_server().await;
    let mut ws = join_raw(port, "room=alpha&username=alice").await;

    let state = next_state(&mut ws).await;
    assert_eq!(state.room_name, "alpha");
    assert!(state.participants.is_empty());
}

#[tokio::test]
async fn test_join_without_room_is_rejected() {
    let port = start_test_server().await;
    let mut ws = join_raw(port, "username=alice").await;

    match next_event(&mut ws).await {
        Some(ServerEvent::Error(payload)) => assert_eq!(payload.message, ROOM_REQUIRED),
        other => panic!("expected room:error, got {other:?}"),
    }
    assert!(next_event(&mut ws).await.is_none(), "socket should be closed");
}

#[tokio::test]
async fn test_auth_header_wins_over_query() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let port = start_test_server().await;
    let mut request = format!("ws://127.0.0.1:{port}/?room=beta")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert("x-room", "alpha".parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    assert_eq!(next_state(&mut ws).await.room_name, "alpha");
}

#[tokio::test]
async fn test_update_is_broadcast_to_sender() {
    let port = start_test_server().await;
    let mut ws = join_raw(port, "room=alpha&username=alice").await;
    next_state(&mut ws).await;

    let alice = Participant::new("a1", "Alice").with_files(["x.ts"]);
    send_update(&mut ws, "alpha", &alice).await;

    let state = next_state(&mut ws).await;
    let participants = sanitize_remote(&state.participants);
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].id, "a1");
    assert_eq!(participants[0].display_name, "Alice");
    assert_eq!(participants[0].files, vec!["x.ts"]);
}

#[tokio::test]
async fn test_cross_room_and_malformed_updates_ignored() {
    let port = start_test_server().await;
    let mut ws = join_raw(port, "room=alpha&username=alice").await;
    next_state(&mut ws).await;

    send_update(&mut ws, "beta", &Participant::new("intruder", "Mallory")).await;
    let bad_id = json!({
        "event": "room:update",
        "data": {"roomName": "alpha", "participant": {"id": 7}}
    });
    ws.send(Message::Text(bad_id.to_string().into())).await.unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();
    send_update(&mut ws, "alpha", &Participant::new("a1", "Alice")).await;

    // Only the valid update produced a broadcast.
    let state = next_state(&mut ws).await;
    assert_eq!(ids(&state), vec!["a1"]);
}

#[tokio::test]
async fn test_handshake_username_fills_missing_name() {
    let port = start_test_server().await;
    let mut ws = join_raw(port, "room=alpha&username=carol").await;
    next_state(&mut ws).await;

    let frame = json!({
        "event": "room:update",
        "data": {"roomName": "alpha", "participant": {"id": "c1", "files": ["a", 1]}}
    });
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();

    let participants = sanitize_remote(&next_state(&mut ws).await.participants);
    assert_eq!(participants[0].display_name, "carol");
    assert_eq!(participants[0].files, vec!["a"]);
}

#[tokio::test]
async fn test_disconnect_removes_participant() {
    let port = start_test_server().await;
    let mut observer = join_raw(port, "room=alpha&username=bob").await;
    next_state(&mut observer).await;

    let mut leaver = join_raw(port, "room=alpha&username=alice").await;
    next_state(&mut leaver).await;
    send_update(&mut leaver, "alpha", &Participant::new("a1", "Alice")).await;

    assert_eq!(ids(&next_state(&mut observer).await), vec!["a1"]);

    leaver.close(None).await.unwrap();
    let state = next_state(&mut observer).await;
    assert_eq!(state.room_name, "alpha");
    assert!(state.participants.is_empty());
}

#[tokio::test]
async fn test_two_clients_see_each_other() {
    let port = start_test_server().await;

    let alice = RoomClient::with_id(client_options(port, "alpha", "Alice"), "alice-id");
    let bob = RoomClient::with_id(client_options(port, "alpha", "Bob"), "bob-id");
    let mut alice_views = alice.subscribe_state().await;
    let mut bob_views = bob.subscribe_state().await;

    // Published while offline; sent as the snapshot on connect.
    alice.publish_local_changes(vec!["src/lib.rs".into()]).await;
    bob.publish_local_changes(vec![]).await;
    alice.connect().await;
    bob.connect().await;

    let alice_view = wait_for_view(&mut alice_views, |v| v.len() == 2).await;
    let bob_view = wait_for_view(&mut bob_views, |v| v.len() == 2).await;

    let me = alice_view.iter().find(|p| p.id == "alice-id").unwrap();
    assert!(me.is_local);
    let remote_alice = bob_view.iter().find(|p| p.id == "alice-id").unwrap();
    assert!(!remote_alice.is_local);
    assert_eq!(remote_alice.files, vec!["src/lib.rs"]);
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    bob.shutdown().await;
    let after = wait_for_view(&mut alice_views, |v| v.iter().all(|p| p.id != "bob-id")).await;
    assert_eq!(after.len(), 1);
}

#[tokio::test]
async fn test_reconnect_resends_local_snapshot() {
    let port = free_port().await;

    let client = RoomClient::with_id(client_options(port, "alpha", "Alice"), "a1");
    let mut connection = client.subscribe_connection().await;
    client.publish_local_changes(vec!["x.ts".into()]).await;
    client.connect().await;

    // The first attempt fails; the server comes up before the retries run out.
    start_server_on(port).await;
    let connected = timeout(Duration::from_secs(5), async {
        while let Some(state) = connection.recv().await {
            if state == ConnectionState::Connected {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(connected);

    // The snapshot may land before or after the observer joins.
    let mut observer = join_raw(port, "room=alpha&username=bob").await;
    let mut state = next_state(&mut observer).await;
    while state.participants.is_empty() {
        state = next_state(&mut observer).await;
    }
    let participants = sanitize_remote(&state.participants);
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].id, "a1");
    assert_eq!(participants[0].files, vec!["x.ts"]);
}

#[tokio::test]
async fn test_id_held_in_other_room_is_not_taken() {
    let port = start_test_server().await;
    let mut observer = join_raw(port, "room=alpha&username=bob").await;
    next_state(&mut observer).await;

    let mut alice = join_raw(port, "room=alpha&username=alice").await;
    next_state(&mut alice).await;
    send_update(&mut alice, "alpha", &Participant::new("a1", "Alice")).await;
    assert_eq!(ids(&next_state(&mut observer).await), vec!["a1"]);

    // Same id from another room is refused; the next update goes through.
    let mut other = join_raw(port, "room=beta&username=mallory").await;
    next_state(&mut other).await;
    send_update(&mut other, "beta", &Participant::new("a1", "Mallory")).await;
    send_update(&mut other, "beta", &Participant::new("m1", "Mallory")).await;
    assert_eq!(ids(&next_state(&mut other).await), vec!["m1"]);

    let mut late = join_raw(port, "room=alpha&username=carol").await;
    let state = next_state(&mut late).await;
    let participants = sanitize_remote(&state.participants);
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].display_name, "Alice");
}

#[tokio::test]
async fn test_update_options_moves_to_new_room() {
    let port = start_test_server().await;

    let client = RoomClient::with_id(client_options(port, "alpha", "Alice"), "a1");
    let mut connection = client.subscribe_connection().await;
    client.publish_local_changes(vec!["x.ts".into()]).await;
    client.connect().await;
    let wait_connected = async {
        while let Some(state) = connection.recv().await {
            if state == ConnectionState::Connected {
                return;
            }
        }
    };
    timeout(Duration::from_secs(5), wait_connected).await.unwrap();

    client.update_options(client_options(port, "beta", "Alice")).await;
    let transitions = timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        while let Some(state) = connection.recv().await {
            seen.push(state);
            if state == ConnectionState::Connected {
                break;
            }
        }
        seen
    })
    .await
    .unwrap();
    assert_eq!(
        transitions,
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );
    assert_eq!(client.options().await.room_name, "beta");

    let mut alpha = join_raw(port, "room=alpha&username=bob").await;
    let mut state = next_state(&mut alpha).await;
    while !state.participants.is_empty() {
        state = next_state(&mut alpha).await;
    }
    assert_eq!(state.room_name, "alpha");

    // The connect-time snapshot may have been refused while alpha held a1.
    client.publish_local_changes(vec!["x.ts".into()]).await;
    let mut beta = join_raw(port, "room=beta&username=bob").await;
    let mut state = next_state(&mut beta).await;
    while state.participants.is_empty() {
        state = next_state(&mut beta).await;
    }
    assert_eq!(ids(&state), vec!["a1"]);
}

#[tokio::test]
async fn test_server_counts_joins_and_updates() {
    let (server, port) = start_shared_server().await;

    let mut rejected = join_raw(port, "username=alice").await;
    assert!(matches!(next_event(&mut rejected).await, Some(ServerEvent::Error(_))));

    let mut ws = join_raw(port, "room=alpha&username=alice").await;
    next_state(&mut ws).await;
    ws.send(Message::Text("not json".into())).await.unwrap();
    send_update(&mut ws, "beta", &Participant::new("a1", "Alice")).await;
    send_update(&mut ws, "alpha", &Participant::new("a1", "Alice")).await;
    next_state(&mut ws).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.rejected_joins, 1);
    assert_eq!(stats.updates_dropped, 2);
    assert_eq!(stats.updates_applied, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(server.room_count().await, 1);
}
