//! WebSocket room server.
//!
//! ```text
//! Client A ──┐                ┌── RoomDirectory (authoritative records)
//!             ├── Room "alpha" ┤
//! Client B ──┘                └── BroadcastGroup ──► room:state to A and B
//! ```
//!
//! Each connection:
//! 1. presents `room`, `username`, `anonymous` at handshake time
//!    (`x-*` headers first, query string second); a blank room is answered
//!    with `room:error` and the socket is closed;
//! 2. joins the room's broadcast group and receives the current `room:state`;
//! 3. sends `room:update` frames, each sanitized, upserted and broadcast;
//! 4. on close, has its participant removed and the new state broadcast.
//!
//! All directory mutation happens under one write lock and each broadcast is
//! sent before that lock is released, so members observe snapshots in the
//! order they were produced.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastGroup, Frame, RoomChannels};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::room::{ConnectionId, RoomDirectory};
use crate::sanitize::{sanitize_participant, Credentials, Handshake};

/// Sent in `room:error` when a connection names no room.
pub const ROOM_REQUIRED: &str = "Room name required to join.";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it starts lagging
    pub broadcast_capacity: usize,
    /// Participants silent for longer than this are swept; `None` disables the sweep
    pub stale_after: Option<Duration>,
    /// How often the staleness sweep runs
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4100".to_string(),
            broadcast_capacity: 64,
            stale_after: None,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_joins: u64,
    pub updates_applied: u64,
    pub updates_dropped: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// State shared by every connection task.
struct Hub {
    directory: RwLock<RoomDirectory>,
    channels: RoomChannels,
    stats: RwLock<ServerStats>,
    next_connection_id: AtomicU64,
}

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// The room server.
pub struct RoomServer {
    config: ServerConfig,
    hub: Arc<Hub>,
}

impl RoomServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Hub {
            directory: RwLock::new(RoomDirectory::new()),
            channels: RoomChannels::new(config.broadcast_capacity),
            stats: RwLock::new(ServerStats::default()),
            next_connection_id: AtomicU64::new(1),
        };
        Self {
            config,
            hub: Arc::new(hub),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Git Room server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if let Some(max_age) = self.config.stale_after {
            self.spawn_sweeper(max_age);
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(hub, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(&self, max_age: Duration) {
        let hub = self.hub.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = hub.sweep_stale(max_age).await;
                if removed > 0 {
                    log::info!("Staleness sweep removed {removed} participants");
                }
            }
        });
    }

    /// Run one staleness sweep over every room now.
    pub async fn sweep_stale(&self, max_age: Duration) -> usize {
        self.hub.sweep_stale(max_age).await
    }

    async fn handle_connection(
        hub: Arc<Hub>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut presented: Option<(Credentials, Credentials)> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                presented = Some(credentials_from_request(req));
                Ok(response)
            },
        )
        .await?;
        let (auth, query) = presented.unwrap_or_default();

        let connection_id = hub.next_connection_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut s = hub.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let Some(handshake) = Handshake::resolve(&auth, &query) else {
            log::warn!("Client {connection_id} ({addr}) rejected: no room name");
            {
                let mut s = hub.stats.write().await;
                s.rejected_joins += 1;
                s.active_connections -= 1;
            }
            return reject(ws_stream).await;
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (group, mut frames) = hub.channels.join(&handshake.room, connection_id).await;
        log::info!(
            "Client {connection_id} ({addr}) joined room {} as {}",
            handshake.room,
            handshake.username
        );

        let result = Self::run_session(
            &hub,
            &handshake,
            connection_id,
            &group,
            &mut ws_sender,
            &mut ws_receiver,
            &mut frames,
        )
        .await;

        hub.disconnect(&handshake.room, connection_id).await;
        log::info!("Client {connection_id} ({addr}) left room {}", handshake.room);
        result
    }

    async fn run_session(
        hub: &Hub,
        handshake: &Handshake,
        connection_id: ConnectionId,
        group: &BroadcastGroup,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        frames: &mut broadcast::Receiver<Frame>,
    ) -> Result<(), ServerError> {
        let initial = hub.directory.read().await.build_room_state(&handshake.room);
        let encoded = ServerMessage::state(initial).encode()?;
        ws_sender.send(Message::Text(encoded.into())).await?;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            hub.apply_update(handshake, connection_id, group, text.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Client {connection_id} closed the connection");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from client {connection_id}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = frames.recv() => {
                    match frame {
                        Ok(frame) => {
                            ws_sender.send(Message::Text(frame.to_string().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // A later snapshot supersedes the skipped ones.
                            log::warn!("Client {connection_id} lagged by {n} frames");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.hub.stats.read().await.clone()
    }

    /// Number of rooms that currently hold participants.
    pub async fn room_count(&self) -> usize {
        self.hub.directory.read().await.room_count()
    }

    pub async fn room_state(&self, room_name: &str) -> crate::protocol::RoomState {
        self.hub.directory.read().await.build_room_state(room_name)
    }
}

impl Hub {
    async fn apply_update(
        &self,
        handshake: &Handshake,
        connection_id: ConnectionId,
        group: &BroadcastGroup,
        text: &str,
    ) {
        let ClientMessage::Update(payload) = match ClientMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping frame from client {connection_id}: {e}");
                self.stats.write().await.updates_dropped += 1;
                return;
            }
        };

        if payload.room_name.as_deref() != Some(handshake.room.as_str()) {
            log::debug!(
                "Dropping update from client {connection_id} for room {:?}",
                payload.room_name
            );
            self.stats.write().await.updates_dropped += 1;
            return;
        }

        let participant =
            match sanitize_participant(payload.participant.as_ref(), &handshake.fallbacks()) {
                Ok(participant) => participant,
                Err(rejection) => {
                    log::warn!("Dropping update from client {connection_id}: {rejection}");
                    self.stats.write().await.updates_dropped += 1;
                    return;
                }
            };

        let mut directory = self.directory.write().await;
        let state = match directory.upsert_participant(&handshake.room, participant, connection_id)
        {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Dropping update from client {connection_id}: {e}");
                self.stats.write().await.updates_dropped += 1;
                return;
            }
        };
        // Counted before the broadcast so a member that sees the frame sees the count.
        self.stats.write().await.updates_applied += 1;
        if let Err(e) = group.broadcast_state(&state) {
            log::error!("Failed to broadcast room {}: {e}", handshake.room);
        }
    }

    async fn disconnect(&self, room_name: &str, connection_id: ConnectionId) {
        let remaining = self.channels.leave(room_name, connection_id).await;
        {
            let mut directory = self.directory.write().await;
            let state = directory.remove_by_connection(connection_id);
            if let (Some(state), Some(group)) = (state, remaining) {
                if let Err(e) = group.broadcast_state(&state) {
                    log::error!("Failed to broadcast room {room_name}: {e}");
                }
            }
        }
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    async fn sweep_stale(&self, max_age: Duration) -> usize {
        let mut directory = self.directory.write().await;
        let mut removed = 0;
        for room_name in directory.room_names() {
            let before = directory.room(&room_name).map_or(0, |room| room.len());
            let state = directory.prune_stale(&room_name, max_age);
            let pruned = before - state.participants.len();
            if pruned == 0 {
                continue;
            }
            removed += pruned;
            if let Some(group) = self.channels.get(&room_name).await {
                if let Err(e) = group.broadcast_state(&state) {
                    log::error!("Failed to broadcast room {room_name}: {e}");
                }
            }
        }
        removed
    }
}

/// Tell the client why, then close.
async fn reject(mut ws_stream: WebSocketStream<TcpStream>) -> Result<(), ServerError> {
    let encoded = ServerMessage::error(ROOM_REQUIRED).encode()?;
    ws_stream.send(Message::Text(encoded.into())).await?;
    if let Err(e) = ws_stream.close(None).await {
        log::debug!("Close after rejection failed: {e}");
    }
    Ok(())
}

/// Split handshake credentials into the auth channel (`x-room`,
/// `x-username`, `x-anonymous` headers) and the query string.
fn credentials_from_request(req: &Request) -> (Credentials, Credentials) {
    let mut auth = Credentials::new();
    for key in ["room", "username", "anonymous"] {
        let header = format!("x-{key}");
        if let Some(value) = req.headers().get(header.as_str()).and_then(|v| v.to_str().ok()) {
            auth.insert(key.to_string(), value.to_string());
        }
    }

    let mut query = Credentials::new();
    if let Some(raw) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()).into_owned() {
            query.entry(key).or_insert(value);
        }
    }

    (auth, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Participant;

    #[test]
    fn test_credentials_from_request() {
        let req = Request::builder()
            .uri("/?room=beta&username=Bob%20B&anonymous=true&room=ignored")
            .header("x-room", "alpha")
            .body(())
            .unwrap();
        let (auth, query) = credentials_from_request(&req);

        assert_eq!(auth.get("room").map(String::as_str), Some("alpha"));
        assert!(auth.get("username").is_none());
        assert_eq!(query.get("room").map(String::as_str), Some("beta"));
        assert_eq!(query.get("username").map(String::as_str), Some("Bob B"));
        assert_eq!(query.get("anonymous").map(String::as_str), Some("true"));
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_participants() {
        let server = RoomServer::with_defaults();
        {
            let mut directory = server.hub.directory.write().await;
            let old = Participant::new("old", "Old").with_last_updated(1);
            directory.upsert_participant("alpha", old, 1).unwrap();
            directory.upsert_participant("alpha", Participant::new("new", "New"), 2).unwrap();
        }

        let removed = server.sweep_stale(Duration::from_secs(60)).await;
        assert_eq!(removed, 1);
        let state = server.room_state("alpha").await;
        assert_eq!(state.participants.len(), 1);
        assert_eq!(state.participants[0].id, "new");
    }
}
