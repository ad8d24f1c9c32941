//! Client-side mirror of a room, merged last-write-wins.
//!
//! ## Merge rule
//!
//! For each incoming record, the held record with the same id is replaced
//! when none exists or when `held.last_updated <= incoming.last_updated`.
//! Ties go to the incoming record. Same-id records are therefore totally
//! ordered by timestamp, so replaying a broadcast or receiving it out of
//! order relative to a local publish converges on the same view.
//!
//! ```text
//! publish_local(files) ──┐
//!                        ├──► merge ──► sort by last_updated desc ──► subscribers
//! room:state ────────────┘
//! ```
//!
//! A `room:state` from the server is the full membership of the room, so
//! [`Reconciler::replace_remote_state`] drops remote records it no longer
//! lists before merging. The local record always survives.

use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;

use crate::protocol::{now_millis, Participant, ANONYMOUS_LABEL, UNKNOWN_LABEL};
use crate::room::sort_by_recency;

/// Fan-out of values to independent channel subscribers.
///
/// Dropping a receiver unsubscribes it; closed senders are pruned on the
/// next notification.
pub struct Subscribers<T> {
    senders: Vec<mpsc::UnboundedSender<T>>,
}

impl<T: Clone> Subscribers<T> {
    pub fn new() -> Self {
        Self { senders: Vec::new() }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    pub fn notify(&mut self, value: &T) {
        self.senders.retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    pub fn clear(&mut self) {
        self.senders.clear();
    }
}

impl<T: Clone> Default for Subscribers<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// How the local user presents themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub username: String,
    pub anonymous: bool,
}

impl LocalIdentity {
    pub fn display_name(&self) -> String {
        if self.anonymous {
            ANONYMOUS_LABEL.to_string()
        } else if self.username.is_empty() {
            UNKNOWN_LABEL.to_string()
        } else {
            self.username.clone()
        }
    }
}

/// The client's best-known view of its room.
pub struct Reconciler {
    local_id: String,
    participants: HashMap<String, Participant>,
    view: Vec<Participant>,
    subscribers: Subscribers<Vec<Participant>>,
}

impl Reconciler {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            participants: HashMap::new(),
            view: Vec::new(),
            subscribers: Subscribers::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Merge a batch of records and publish the resulting view.
    pub fn merge_remote_state(&mut self, incoming: Vec<Participant>) -> Vec<Participant> {
        for record in incoming {
            self.merge_one(record);
        }

        let mut view: Vec<Participant> = self.participants.values().cloned().collect();
        sort_by_recency(&mut view);
        self.view = view;

        let snapshot = self.latest_state();
        self.subscribers.notify(&snapshot);
        snapshot
    }

    /// Apply a full room snapshot: forget remote records it omits, then merge.
    pub fn replace_remote_state(&mut self, incoming: Vec<Participant>) -> Vec<Participant> {
        let listed: HashSet<&str> = incoming.iter().map(|p| p.id.as_str()).collect();
        let local_id = &self.local_id;
        self.participants
            .retain(|id, held| held.is_local || id == local_id || listed.contains(id.as_str()));
        self.merge_remote_state(incoming)
    }

    fn merge_one(&mut self, incoming: Participant) {
        match self.participants.get_mut(&incoming.id) {
            Some(held) if held.last_updated <= incoming.last_updated => {
                let is_local = incoming.is_local || held.is_local;
                *held = Participant {
                    is_local,
                    ..incoming
                };
            }
            Some(held) => {
                log::trace!(
                    "Ignoring stale record for {} ({} < {})",
                    incoming.id,
                    incoming.last_updated,
                    held.last_updated
                );
            }
            None => {
                self.participants.insert(incoming.id.clone(), incoming);
            }
        }
    }

    /// Stamp the local file list, merge it, and return the record to send.
    pub fn publish_local(&mut self, files: Vec<String>, identity: &LocalIdentity) -> Participant {
        let participant = Participant {
            id: self.local_id.clone(),
            display_name: identity.display_name(),
            files,
            last_updated: now_millis(),
            anonymous: identity.anonymous,
            is_local: true,
        };
        self.merge_remote_state(vec![participant.clone()]);
        participant
    }

    /// The local participant as last merged, if it has published.
    pub fn local_snapshot(&self) -> Option<Participant> {
        self.participants.get(&self.local_id).cloned()
    }

    /// Copy of the current view, most recently active first.
    pub fn latest_state(&self) -> Vec<Participant> {
        self.view.clone()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Vec<Participant>> {
        self.subscribers.subscribe()
    }

    pub fn clear_subscribers(&mut self) {
        self.subscribers.clear();
    }
}
