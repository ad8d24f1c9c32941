//! # git-room: live "who is touching which files" presence for Git teams
//!
//! Clients publish the list of files they have changed against a branch;
//! the server keeps one record per participant per room and broadcasts the
//! whole room whenever it changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ RoomClient  │ ◄─────────────────► │ RoomServer  │
//! │ (per user)  │     JSON events     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌───────────────┐
//! │ Reconciler  │                     │ RoomDirectory │
//! │ (LWW view)  │                     │ (authority)   │
//! └─────────────┘                     └──────┬────────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │ BroadcastGroup │
//!                                    │ (fan-out)      │
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes and the participant record
//! - [`room`]: server-side room directory
//! - [`sanitize`]: validation of untrusted payloads and handshakes
//! - [`broadcast`]: per-room fan-out
//! - [`server`]: WebSocket session handling
//! - [`reconciler`]: client-side last-write-wins merge
//! - [`client`]: connection state machine and reconnecting client
//! - [`config`]: client settings file
//! - [`changes`]: `git diff` based change detection
//! - [`view`]: text rendering of a room

pub mod protocol;
pub mod room;
pub mod sanitize;
pub mod broadcast;
pub mod server;
pub mod reconciler;
pub mod client;
pub mod config;
pub mod changes;
pub mod view;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, Participant, ProtocolError, RoomState, ServerEvent, ServerMessage,
};
pub use room::{ConnectionId, DirectoryError, RoomDirectory};
pub use sanitize::{sanitize_participant, Handshake, Rejection};
pub use broadcast::{BroadcastGroup, RoomChannels};
pub use server::{RoomServer, ServerConfig, ServerError, ServerStats};
pub use reconciler::{LocalIdentity, Reconciler};
pub use client::{ConnectionState, ConnectionStateMachine, RoomClient, RoomClientOptions};
pub use config::{ConfigError, Settings};
pub use changes::{ChangeTracker, ChangeTrackerError};
