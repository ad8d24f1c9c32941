//! Client settings, read from a TOML file.
//!
//! ```toml
//! room_name = "payments-team"
//! username = "alice"
//! server_url = "ws://localhost:4100"
//! refresh_interval = 30
//! git_branch = "main"
//! anonymous_mode = false
//! ```
//!
//! Every field is optional. Values are normalized after loading: names are
//! trimmed, the refresh interval is clamped to 10..=300 seconds, and blank
//! server or branch values fall back to their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::RoomClientOptions;

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:4100";
pub const DEFAULT_BRANCH: &str = "main";
/// Seconds between change publications.
pub const DEFAULT_REFRESH_INTERVAL: u64 = 30;
pub const MIN_REFRESH_INTERVAL: u64 = 10;
pub const MAX_REFRESH_INTERVAL: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// User settings for the room client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub room_name: String,
    pub username: String,
    pub server_url: String,
    /// Seconds between change publications.
    pub refresh_interval: u64,
    /// Branch that local changes are diffed against.
    pub git_branch: String,
    pub anonymous_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            room_name: String::new(),
            username: String::new(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            git_branch: DEFAULT_BRANCH.to_string(),
            anonymous_mode: false,
        }
    }
}

impl Settings {
    /// Read and normalize a settings file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`Settings::load`], but a missing or unreadable file yields the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            log::debug!("No settings file at {}; using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("{e}; using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        let settings: Settings = toml::from_str(text)?;
        Ok(settings.normalized())
    }

    pub fn normalized(mut self) -> Self {
        self.room_name = self.room_name.trim().to_string();
        self.username = self.username.trim().to_string();
        self.server_url = self.server_url.trim().to_string();
        if self.server_url.is_empty() {
            self.server_url = DEFAULT_SERVER_URL.to_string();
        }
        self.git_branch = self.git_branch.trim().to_string();
        if self.git_branch.is_empty() {
            self.git_branch = DEFAULT_BRANCH.to_string();
        }
        self.refresh_interval = self
            .refresh_interval
            .clamp(MIN_REFRESH_INTERVAL, MAX_REFRESH_INTERVAL);
        self
    }

    /// Whether there is a room to join.
    pub fn is_configured(&self) -> bool {
        !self.room_name.is_empty()
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn client_options(&self) -> RoomClientOptions {
        RoomClientOptions {
            server_url: self.server_url.clone(),
            room_name: self.room_name.clone(),
            username: self.username.clone(),
            anonymous_mode: self.anonymous_mode,
            ..RoomClientOptions::default()
        }
    }
}
