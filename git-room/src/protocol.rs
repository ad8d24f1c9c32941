//! JSON wire protocol shared by the room server and its clients.
//!
//! Every WebSocket text frame carries one envelope:
//! ```text
//! { "event": "room:update" | "room:state" | "room:error", "data": { … } }
//! ```
//!
//! | Event         | Direction       | Payload                                  |
//! |---------------|-----------------|------------------------------------------|
//! | `room:update` | client → server | `{ roomName, participant }`              |
//! | `room:state`  | server → client | `{ roomName, participants: [..] }`       |
//! | `room:error`  | server → client | `{ message }`, then the socket is closed |
//!
//! Inbound participant payloads stay untyped (`serde_json::Value`) until
//! they pass through [`crate::sanitize`]; outbound ones are always typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Display name reported for every participant in anonymous mode.
pub const ANONYMOUS_LABEL: &str = "Anonymous";

/// Display name used when neither the payload nor the handshake carry one.
pub const UNKNOWN_LABEL: &str = "Unknown";

pub const EVENT_UPDATE: &str = "room:update";
pub const EVENT_STATE: &str = "room:state";
pub const EVENT_ERROR: &str = "room:error";

/// Milliseconds since the UNIX epoch, used as the logical clock of a snapshot.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One user's presence snapshot within a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    #[serde(rename = "username")]
    pub display_name: String,
    pub files: Vec<String>,
    #[serde(rename = "lastUpdated")]
    pub last_updated: u64,
    pub anonymous: bool,
    /// Marks the record of the viewing user. Client-side only.
    #[serde(skip)]
    pub is_local: bool,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            files: Vec::new(),
            last_updated: now_millis(),
            anonymous: false,
            is_local: false,
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_last_updated(mut self, last_updated: u64) -> Self {
        self.last_updated = last_updated;
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self.display_name = ANONYMOUS_LABEL.to_string();
        self
    }
}

/// Full snapshot of a room as broadcast by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    #[serde(rename = "roomName")]
    pub room_name: String,
    pub participants: Vec<Participant>,
}

impl RoomState {
    pub fn empty(room_name: impl Into<String>) -> Self {
        Self {
            room_name: room_name.into(),
            participants: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

/// `room:update` payload. The participant is kept raw until sanitized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(rename = "roomName", default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub participant: Option<Value>,
}

impl UpdatePayload {
    pub fn new(room_name: &str, participant: &Participant) -> Result<Self, ProtocolError> {
        let participant = serde_json::to_value(participant)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            room_name: Some(room_name.to_string()),
            participant: Some(participant),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// `room:state` as seen by a client before its entries are validated.
#[derive(Debug, Clone, Deserialize)]
pub struct RawRoomState {
    #[serde(rename = "roomName", default)]
    pub room_name: String,
    #[serde(default)]
    pub participants: Vec<Value>,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "room:update")]
    Update(UpdatePayload),
}

/// Messages the server sends to its clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "room:state")]
    State(RoomState),
    #[serde(rename = "room:error")]
    Error(ErrorPayload),
}

/// Client-side decoding of [`ServerMessage`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "room:state")]
    State(RawRoomState),
    #[serde(rename = "room:error")]
    Error(ErrorPayload),
}

impl ClientMessage {
    pub fn update(room_name: &str, participant: &Participant) -> Result<Self, ProtocolError> {
        Ok(Self::Update(UpdatePayload::new(room_name, participant)?))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    pub fn state(state: RoomState) -> Self {
        Self::State(state)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl ServerEvent {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Handshake error: {0}")]
    Handshake(String),
}
