//! Server-side room directory: the authoritative participant records.
//!
//! ```text
//! RoomDirectory
//!   ├── rooms:    room name ──► ParticipantStore (participant id ──► record)
//!   └── bindings: connection ──► (room name, participant id)
//! ```
//!
//! A room exists only while it has participants. Bindings let the server
//! find the participant to drop when a socket goes away without a leave
//! message.

use std::collections::HashMap;
use std::time::Duration;

use crate::protocol::{now_millis, Participant, RoomState};

/// Transport-level connection identity, assigned by the server per socket.
pub type ConnectionId = u64;

/// A stored participant plus the connection currently publishing it.
#[derive(Debug, Clone)]
struct ParticipantRecord {
    participant: Participant,
    connection_id: ConnectionId,
}

/// Where a live connection's participant lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub room_name: String,
    pub participant_id: String,
}

/// Participants of a single room, unique by id.
#[derive(Debug, Default)]
pub struct ParticipantStore {
    records: HashMap<String, ParticipantRecord>,
}

impl ParticipantStore {
    fn upsert(&mut self, participant: Participant, connection_id: ConnectionId) {
        self.records.insert(
            participant.id.clone(),
            ParticipantRecord {
                participant,
                connection_id,
            },
        );
    }

    fn remove(&mut self, participant_id: &str) -> Option<ParticipantRecord> {
        self.records.remove(participant_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        self.records.get(participant_id).map(|r| &r.participant)
    }

    /// Participants sorted by `last_updated`, most recent first.
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self
            .records
            .values()
            .map(|r| r.participant.clone())
            .collect();
        sort_by_recency(&mut participants);
        participants
    }
}

/// Sort most recently active first.
pub fn sort_by_recency(participants: &mut [Participant]) {
    participants.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("participant {participant_id} is held by another connection in room {room_name}")]
    HeldElsewhere {
        participant_id: String,
        room_name: String,
    },
}

/// Maps room names to their participant stores.
///
/// Not synchronized; the server keeps it behind a lock so every mutation is
/// serialized.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, ParticipantStore>,
    bindings: HashMap<ConnectionId, Binding>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `participant` in `room_name` and bind it to the connection.
    ///
    /// The caller's timestamp is trusted as-is. An id lives in one room at a
    /// time: claiming an id that another connection holds in a different room
    /// fails and leaves the directory unchanged.
    pub fn upsert_participant(
        &mut self,
        room_name: &str,
        participant: Participant,
        connection_id: ConnectionId,
    ) -> Result<RoomState, DirectoryError> {
        if let Some(home) = self.held_elsewhere(room_name, &participant.id, connection_id) {
            return Err(DirectoryError::HeldElsewhere {
                participant_id: participant.id,
                room_name: home.to_string(),
            });
        }

        // A connection publishes one participant; a new id or room replaces the old one.
        if let Some(previous) = self.bindings.get(&connection_id).cloned() {
            if previous.room_name != room_name || previous.participant_id != participant.id {
                self.remove_owned(&previous.room_name, &previous.participant_id, connection_id);
            }
        }

        let binding = Binding {
            room_name: room_name.to_string(),
            participant_id: participant.id.clone(),
        };
        self.rooms
            .entry(room_name.to_string())
            .or_default()
            .upsert(participant, connection_id);
        self.bindings.insert(connection_id, binding);

        Ok(self.build_room_state(room_name))
    }

    /// Drop the participant bound to a closed connection.
    ///
    /// Returns `None` when the connection never published. When the room
    /// empties it is deleted and an empty state is returned.
    pub fn remove_by_connection(&mut self, connection_id: ConnectionId) -> Option<RoomState> {
        let binding = self.bindings.remove(&connection_id)?;
        let room = self.rooms.get_mut(&binding.room_name)?;

        let owned_by_connection = room
            .records
            .get(&binding.participant_id)
            .is_some_and(|r| r.connection_id == connection_id);
        if owned_by_connection {
            room.remove(&binding.participant_id);
        }

        if room.is_empty() {
            self.rooms.remove(&binding.room_name);
            return Some(RoomState::empty(binding.room_name));
        }

        Some(self.build_room_state(&binding.room_name))
    }

    /// Snapshot of a room; unknown rooms yield an empty participant list.
    pub fn build_room_state(&self, room_name: &str) -> RoomState {
        match self.rooms.get(room_name) {
            Some(room) => RoomState {
                room_name: room_name.to_string(),
                participants: room.snapshot(),
            },
            None => RoomState::empty(room_name),
        }
    }

    /// Remove participants whose `last_updated` is older than `max_age`.
    pub fn prune_stale(&mut self, room_name: &str, max_age: Duration) -> RoomState {
        let threshold = now_millis().saturating_sub(max_age.as_millis() as u64);
        self.prune_older_than(room_name, threshold)
    }

    fn prune_older_than(&mut self, room_name: &str, threshold: u64) -> RoomState {
        let Some(room) = self.rooms.get_mut(room_name) else {
            return RoomState::empty(room_name);
        };

        let stale: Vec<String> = room
            .records
            .values()
            .filter(|r| r.participant.last_updated < threshold)
            .map(|r| r.participant.id.clone())
            .collect();

        for id in &stale {
            if let Some(record) = room.remove(id) {
                self.bindings.remove(&record.connection_id);
                log::debug!("Pruned stale participant {id} from room {room_name}");
            }
        }

        if room.is_empty() {
            self.rooms.remove(room_name);
            return RoomState::empty(room_name);
        }

        self.build_room_state(room_name)
    }

    pub fn binding(&self, connection_id: ConnectionId) -> Option<&Binding> {
        self.bindings.get(&connection_id)
    }

    pub fn room(&self, room_name: &str) -> Option<&ParticipantStore> {
        self.rooms.get(room_name)
    }

    pub fn contains_room(&self, room_name: &str) -> bool {
        self.rooms.contains_key(room_name)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    /// The other room holding `participant_id` for a different connection.
    fn held_elsewhere(
        &self,
        room_name: &str,
        participant_id: &str,
        connection_id: ConnectionId,
    ) -> Option<&str> {
        self.rooms.iter().find_map(|(name, room)| {
            let record = room.records.get(participant_id)?;
            (name != room_name && record.connection_id != connection_id).then_some(name.as_str())
        })
    }

    /// Remove a record if `connection_id` still publishes it, and the room if
    /// it is left empty.
    fn remove_owned(&mut self, room_name: &str, participant_id: &str, connection_id: ConnectionId) {
        let Some(room) = self.rooms.get_mut(room_name) else {
            return;
        };
        let owned = room
            .records
            .get(participant_id)
            .is_some_and(|r| r.connection_id == connection_id);
        if owned {
            room.remove(participant_id);
        }
        if room.is_empty() {
            self.rooms.remove(room_name);
        }
    }
}
