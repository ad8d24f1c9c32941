//! WebSocket client for the room server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reset) with bounded
//!   automatic reconnection
//! - Local snapshot publishing, resent on every (re)connect
//! - Merging of `room:state` broadcasts into the [`Reconciler`]
//! - Subscriptions for view and connection-state changes
//!
//! ```text
//!             connect()                 socket open
//! Disconnected ─────────► Connecting ─────────────► Connected
//!      ▲                      │                         │
//!      └──────────────────────┴─── failure / drop ──────┘
//!                (retried up to reconnect_attempts times)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

use crate::protocol::{ClientMessage, Participant, ProtocolError, ServerEvent, ANONYMOUS_LABEL};
use crate::reconciler::{LocalIdentity, Reconciler, Subscribers};
use crate::sanitize::sanitize_remote;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(label)
    }
}

/// Tracks the connection state and notifies on actual changes only.
pub struct ConnectionStateMachine {
    state: ConnectionState,
    subscribers: Subscribers<ConnectionState>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            subscribers: Subscribers::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Re-entering the current state is a no-op.
    ///
    /// Returns whether the state changed.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        log::debug!("Connection state {} -> {}", self.state, next);
        self.state = next;
        self.subscribers.notify(&next);
        true
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.subscribers.subscribe()
    }

    pub fn clear_subscribers(&mut self) {
        self.subscribers.clear();
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection options. Changing them requires [`RoomClient::update_options`].
#[derive(Debug, Clone, PartialEq)]
pub struct RoomClientOptions {
    pub server_url: String,
    pub room_name: String,
    pub username: String,
    pub anonymous_mode: bool,
    /// Retries after a failed connect or a dropped session.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for RoomClientOptions {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:4100".to_string(),
            room_name: String::new(),
            username: String::new(),
            anonymous_mode: false,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(2000),
        }
    }
}

impl RoomClientOptions {
    fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            username: self.username.trim().to_string(),
            anonymous: self.anonymous_mode,
        }
    }

    /// Server URL with the handshake encoded as query parameters.
    ///
    /// `http(s)` URLs are accepted and mapped to `ws(s)`.
    pub fn connect_url(&self) -> Result<Url, ProtocolError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|e| ProtocolError::Handshake(format!("invalid server URL: {e}")))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ProtocolError::Handshake(format!(
                    "unsupported URL scheme: {other}"
                )))
            }
        };
        if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
            return Err(ProtocolError::Handshake(format!(
                "cannot use {scheme} for {}",
                self.server_url
            )));
        }
        url.query_pairs_mut()
            .append_pair("room", self.room_name.trim())
            .append_pair("username", &self.handshake_username())
            .append_pair("anonymous", if self.anonymous_mode { "true" } else { "false" });
        Ok(url)
    }

    fn handshake_username(&self) -> String {
        let name = self.username.trim();
        if name.is_empty() {
            ANONYMOUS_LABEL.to_string()
        } else {
            name.to_string()
        }
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How a socket session ended.
#[derive(Debug)]
enum SessionEnd {
    /// The server refused the join; no retry.
    Rejected(String),
    Closed(String),
}

/// State shared between the client handle and its session task.
struct Shared {
    options: RwLock<RoomClientOptions>,
    reconciler: Mutex<Reconciler>,
    connection: Mutex<ConnectionStateMachine>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
}

impl Shared {
    async fn set_state(&self, next: ConnectionState) -> bool {
        self.connection.lock().await.transition(next)
    }

    async fn state(&self) -> ConnectionState {
        self.connection.lock().await.state()
    }

    async fn send_update(&self, room_name: &str, participant: &Participant) {
        let encoded = match ClientMessage::update(room_name, participant).and_then(|m| m.encode()) {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed to encode room update: {e}");
                return;
            }
        };
        let tx = self.outgoing.lock().await.clone();
        match tx {
            Some(tx) => {
                if tx.send(encoded).await.is_err() {
                    log::debug!("Session closed before update could be sent.");
                }
            }
            None => log::debug!("No active session; update kept locally."),
        }
    }

    async fn send_local_snapshot(&self, room_name: &str) {
        let snapshot = self.reconciler.lock().await.local_snapshot();
        if let Some(participant) = snapshot {
            self.send_update(room_name, &participant).await;
        }
    }

    async fn apply_frame(&self, text: &str, room_name: &str) -> Option<String> {
        match ServerEvent::decode(text) {
            Ok(ServerEvent::State(raw)) => {
                if raw.room_name != room_name {
                    log::debug!("Ignoring state for room {}", raw.room_name);
                    return None;
                }
                log::debug!("Received room state update from server.");
                let participants = sanitize_remote(&raw.participants);
                self.reconciler.lock().await.replace_remote_state(participants);
                None
            }
            Ok(ServerEvent::Error(payload)) => {
                log::error!("Server rejected join: {}", payload.message);
                Some(payload.message)
            }
            Err(e) => {
                log::debug!("Ignoring malformed frame: {e}");
                None
            }
        }
    }
}

/// The room client.
///
/// All methods take `&self`; share it behind an `Arc` between the refresh
/// loop and whatever drives connect/reset.
pub struct RoomClient {
    local_id: String,
    shared: Arc<Shared>,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl RoomClient {
    /// Create a client with a fresh random participant id.
    pub fn new(options: RoomClientOptions) -> Self {
        Self::with_id(options, Uuid::new_v4().to_string())
    }

    pub fn with_id(options: RoomClientOptions, local_id: impl Into<String>) -> Self {
        let local_id = local_id.into();
        Self {
            shared: Arc::new(Shared {
                options: RwLock::new(options),
                reconciler: Mutex::new(Reconciler::new(local_id.clone())),
                connection: Mutex::new(ConnectionStateMachine::new()),
                outgoing: Mutex::new(None),
            }),
            local_id,
            session: Mutex::new(None),
        }
    }

    /// Start a session unless one is already running.
    ///
    /// Without a room name this only logs a warning.
    pub async fn connect(&self) {
        let options = self.shared.options.read().await.clone();
        if options.room_name.trim().is_empty() {
            log::warn!("Room name not configured. Skipping connection.");
            return;
        }

        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|handle| !handle.is_finished()) {
            log::debug!("Session already active.");
            return;
        }

        log::info!("Connecting to Git Room server at {}", options.server_url);
        self.shared.set_state(ConnectionState::Connecting).await;
        *session = Some(tokio::spawn(run_session(self.shared.clone(), options)));
    }

    /// Tear down the session and settle in `Disconnected`.
    pub async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(handle) = session {
            handle.abort();
            // Wait for the task to stop so it can't publish a later state.
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    log::error!("Session task failed: {e}");
                }
            }
        }
        *self.shared.outgoing.lock().await = None;
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Drop the current session and connect again with the same options.
    pub async fn reset(&self) {
        self.disconnect().await;
        self.connect().await;
    }

    /// Replace the options and re-establish the connection with them.
    pub async fn update_options(&self, options: RoomClientOptions) {
        *self.shared.options.write().await = options;
        self.reset().await;
    }

    /// Publish the local file list: merge it locally, send it if connected.
    pub async fn publish_local_changes(&self, files: Vec<String>) {
        let options = self.shared.options.read().await.clone();
        let participant = self
            .shared
            .reconciler
            .lock()
            .await
            .publish_local(files, &options.identity());

        if self.shared.state().await == ConnectionState::Connected {
            self.shared.send_update(options.room_name.trim(), &participant).await;
        }
    }

    pub async fn latest_state(&self) -> Vec<Participant> {
        self.shared.reconciler.lock().await.latest_state()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.state().await
    }

    /// View changes; drop the receiver to unsubscribe.
    pub async fn subscribe_state(&self) -> mpsc::UnboundedReceiver<Vec<Participant>> {
        self.shared.reconciler.lock().await.subscribe()
    }

    /// Connection state changes; drop the receiver to unsubscribe.
    pub async fn subscribe_connection(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.shared.connection.lock().await.subscribe()
    }

    pub async fn options(&self) -> RoomClientOptions {
        self.shared.options.read().await.clone()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Disconnect and release every subscriber.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.shared.reconciler.lock().await.clear_subscribers();
        self.shared.connection.lock().await.clear_subscribers();
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_session(shared: Arc<Shared>, options: RoomClientOptions) {
    let mut attempts = 0u32;
    loop {
        shared.set_state(ConnectionState::Connecting).await;
        match open_socket(&options).await {
            Ok(socket) => {
                attempts = 0;
                let end = drive_socket(&shared, &options, socket).await;
                *shared.outgoing.lock().await = None;
                shared.set_state(ConnectionState::Disconnected).await;
                match end {
                    SessionEnd::Rejected(message) => {
                        log::warn!("Not reconnecting: {message}");
                        return;
                    }
                    SessionEnd::Closed(reason) => {
                        log::warn!("Disconnected from Git Room server ({reason}).");
                    }
                }
            }
            Err(e) => {
                log::error!("Failed to connect to Git Room server. {e}");
                shared.set_state(ConnectionState::Disconnected).await;
            }
        }

        attempts += 1;
        if attempts > options.reconnect_attempts {
            log::warn!(
                "Giving up after {} reconnection attempts.",
                options.reconnect_attempts
            );
            return;
        }
        tokio::time::sleep(options.reconnect_delay).await;
    }
}

async fn open_socket(options: &RoomClientOptions) -> Result<Socket, ProtocolError> {
    let url = options.connect_url()?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;

    // Auth headers; values that are not valid header text travel in the query only.
    let headers = request.headers_mut();
    let auth = [
        ("x-room", options.room_name.trim().to_string()),
        ("x-username", options.handshake_username()),
        ("x-anonymous", options.anonymous_mode.to_string()),
    ];
    for (name, value) in auth {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }

    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
    Ok(socket)
}

async fn drive_socket(shared: &Shared, options: &RoomClientOptions, socket: Socket) -> SessionEnd {
    let (mut writer, mut reader) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    *shared.outgoing.lock().await = Some(tx);

    shared.set_state(ConnectionState::Connected).await;
    log::info!("Connected to Git Room server.");
    shared.send_local_snapshot(options.room_name.trim()).await;

    let mut rejection: Option<String> = None;
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    return SessionEnd::Closed("client shutdown".into());
                };
                if let Err(e) = writer.send(Message::Text(text.into())).await {
                    return SessionEnd::Closed(e.to_string());
                }
            }

            inbound = reader.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let room_name = options.room_name.trim();
                        if let Some(message) = shared.apply_frame(text.as_str(), room_name).await {
                            rejection = Some(message);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return match rejection.take() {
                            Some(message) => SessionEnd::Rejected(message),
                            None => SessionEnd::Closed("server closed the connection".into()),
                        };
                    }
                    Some(Err(e)) => {
                        return match rejection.take() {
                            Some(message) => SessionEnd::Rejected(message),
                            None => SessionEnd::Closed(e.to_string()),
                        };
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
