//! Validation of participant payloads received from peers.
//!
//! A raw JSON value is first checked into [`ParticipantFields`] (every
//! field typed, absent or ill-typed values recorded as `None`), then
//! completed with the receiver's [`Fallbacks`]. Payloads without a string
//! `id` are rejected outright; every other field degrades to a default.

use std::collections::HashMap;

use serde_json::Value;

use crate::protocol::{now_millis, Participant, ANONYMOUS_LABEL, UNKNOWN_LABEL};

/// Why a participant payload was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("participant payload missing")]
    Missing,
    #[error("participant payload is not an object")]
    NotAnObject,
    #[error("participant id is not a string")]
    NonStringId,
}

/// Values used for fields a payload leaves out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fallbacks {
    pub username: String,
    pub anonymous: bool,
}

impl Default for Fallbacks {
    fn default() -> Self {
        Self {
            username: UNKNOWN_LABEL.to_string(),
            anonymous: false,
        }
    }
}

/// A payload after type checking, before defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantFields {
    pub id: String,
    pub username: Option<String>,
    pub files: Vec<String>,
    pub anonymous: Option<bool>,
    pub last_updated: Option<u64>,
}

impl ParticipantFields {
    pub fn check(value: Option<&Value>) -> Result<Self, Rejection> {
        let object = match value {
            None | Some(Value::Null) => return Err(Rejection::Missing),
            Some(Value::Object(object)) => object,
            Some(_) => return Err(Rejection::NotAnObject),
        };

        let id = match object.get("id") {
            Some(Value::String(id)) => id.clone(),
            _ => return Err(Rejection::NonStringId),
        };

        let files = match object.get("files") {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|entry| entry.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let username = object
            .get("username")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let last_updated = object.get("lastUpdated").and_then(timestamp);

        Ok(Self {
            id,
            username,
            files,
            anonymous: object.get("anonymous").and_then(Value::as_bool),
            last_updated,
        })
    }

    /// Fill the gaps. Anonymous participants always carry the fixed label.
    pub fn complete(self, fallbacks: &Fallbacks) -> Participant {
        let anonymous = self.anonymous.unwrap_or(fallbacks.anonymous);
        let display_name = if anonymous {
            ANONYMOUS_LABEL.to_string()
        } else {
            self.username
                .or_else(|| Some(fallbacks.username.clone()).filter(|n| !n.is_empty()))
                .unwrap_or_else(|| UNKNOWN_LABEL.to_string())
        };

        Participant {
            id: self.id,
            display_name,
            files: self.files,
            last_updated: self.last_updated.unwrap_or_else(now_millis),
            anonymous,
            is_local: false,
        }
    }
}

fn timestamp(value: &Value) -> Option<u64> {
    let Value::Number(number) = value else {
        return None;
    };
    if let Some(ms) = number.as_u64() {
        return Some(ms);
    }
    number
        .as_f64()
        .filter(|ms| ms.is_finite())
        .map(|ms| ms.max(0.0) as u64)
}

/// Rebuild an inbound participant field by field.
pub fn sanitize_participant(
    value: Option<&Value>,
    fallbacks: &Fallbacks,
) -> Result<Participant, Rejection> {
    ParticipantFields::check(value).map(|fields| fields.complete(fallbacks))
}

/// Validate the entries of a received `room:state`, dropping bad ones.
pub fn sanitize_remote(values: &[Value]) -> Vec<Participant> {
    let fallbacks = Fallbacks::default();
    values
        .iter()
        .filter_map(|value| match sanitize_participant(Some(value), &fallbacks) {
            Ok(participant) => Some(participant),
            Err(rejection) => {
                log::debug!("Dropping remote participant entry: {rejection}");
                None
            }
        })
        .collect()
}

/// Name/value pairs a connection presented at handshake time.
pub type Credentials = HashMap<String, String>;

/// Identity a connection declared when it joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub room: String,
    pub username: String,
    pub anonymous: bool,
}

impl Handshake {
    /// Resolve from the auth channel first, then the query string.
    ///
    /// Returns `None` when no non-blank room name was supplied.
    pub fn resolve(auth: &Credentials, query: &Credentials) -> Option<Self> {
        let room = auth
            .get("room")
            .or_else(|| query.get("room"))
            .map(|room| room.trim().to_string())
            .unwrap_or_default();
        if room.is_empty() {
            return None;
        }

        let username = [auth.get("username"), query.get("username")]
            .into_iter()
            .flatten()
            .map(|name| name.trim())
            .find(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_LABEL)
            .to_string();

        let anonymous = match auth.get("anonymous") {
            Some(flag) => flag == "true",
            None => query.get("anonymous").is_some_and(|flag| flag == "true"),
        };

        Some(Self {
            room,
            username,
            anonymous,
        })
    }

    pub fn fallbacks(&self) -> Fallbacks {
        Fallbacks {
            username: self.username.clone(),
            anonymous: self.anonymous,
        }
    }
}
