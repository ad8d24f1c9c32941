//! Per-room fan-out of encoded `room:state` frames.
//!
//! Uses tokio broadcast channels so one send reaches every connection
//! joined to the room, the sender included. Each connection gets an
//! independent receiver buffering up to `capacity` frames; a connection
//! that lags only misses intermediate snapshots, and the next full
//! snapshot supersedes them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, RoomState, ServerMessage};
use crate::room::ConnectionId;

/// Encoded frame shared by every receiver.
pub type Frame = Arc<String>;

/// The connections joined to one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    members: RwLock<HashSet<ConnectionId>>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per member.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
        }
    }

    /// Join a connection and hand back its receiver.
    pub async fn join(&self, connection_id: ConnectionId) -> broadcast::Receiver<Frame> {
        self.members.write().await.insert(connection_id);
        self.sender.subscribe()
    }

    pub async fn leave(&self, connection_id: ConnectionId) -> bool {
        self.members.write().await.remove(&connection_id)
    }

    /// Encode a room state once and send it to every member.
    ///
    /// Returns the number of receivers reached.
    pub fn broadcast_state(&self, state: &RoomState) -> Result<usize, ProtocolError> {
        let encoded = ServerMessage::state(state.clone()).encode()?;
        Ok(self.sender.send(Arc::new(encoded)).unwrap_or(0))
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }
}

/// Room name → broadcast group.
///
/// Groups track transport membership, which starts at join time, while
/// the room directory only learns about a connection on its first update.
pub struct RoomChannels {
    groups: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomChannels {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Join a connection to a room's group, creating the group if needed.
    ///
    /// Holds the map lock across creation and join so a concurrent last
    /// `leave` cannot drop the group in between.
    pub async fn join(
        &self,
        room_name: &str,
        connection_id: ConnectionId,
    ) -> (Arc<BroadcastGroup>, broadcast::Receiver<Frame>) {
        let mut groups = self.groups.write().await;
        let group = groups
            .entry(room_name.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone();
        let rx = group.join(connection_id).await;
        (group, rx)
    }

    pub async fn get(&self, room_name: &str) -> Option<Arc<BroadcastGroup>> {
        self.groups.read().await.get(room_name).cloned()
    }

    /// Remove a connection from its room's group, dropping the group once empty.
    ///
    /// Returns the group if members remain.
    pub async fn leave(
        &self,
        room_name: &str,
        connection_id: ConnectionId,
    ) -> Option<Arc<BroadcastGroup>> {
        let mut groups = self.groups.write().await;
        let group = groups.get(room_name)?.clone();
        group.leave(connection_id).await;
        if group.member_count().await == 0 {
            groups.remove(room_name);
            return None;
        }
        Some(group)
    }
}
