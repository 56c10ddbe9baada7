//! Configuration module for the Matrixon room server
//!
//! These structures are deserialized by the layered loader in the server crate
//! and can also be built directly when embedding the room server.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use matrixon_common::{MatrixonError, Result};

/// Room server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomServerConfig {
    /// Name of this homeserver (e.g. matrixon.local)
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// `tracing` filter directives
    #[serde(default = "default_log")]
    pub log: String,

    #[serde(default)]
    pub input: InputConfig,
}

/// Event admission settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Upper bound on a single admission, including all federation fetches
    #[serde(default = "default_max_processing_time_secs")]
    pub max_processing_time_secs: u64,

    /// `limit` sent with `/get_missing_events`
    #[serde(default = "default_missing_events_limit")]
    pub missing_events_limit: u32,

    /// Pending admissions buffered per room before callers wait
    #[serde(default = "default_room_queue_capacity")]
    pub room_queue_capacity: usize,

    /// Seconds a room worker waits for work before shutting down
    #[serde(default = "default_room_worker_idle_secs")]
    pub room_worker_idle_secs: u64,
}

fn default_server_name() -> String {
    "localhost".to_owned()
}

fn default_log() -> String {
    "warn,matrixon_roomserver=info".to_owned()
}

fn default_max_processing_time_secs() -> u64 {
    120
}

fn default_missing_events_limit() -> u32 {
    20
}

fn default_room_queue_capacity() -> usize {
    64
}

fn default_room_worker_idle_secs() -> u64 {
    300
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            max_processing_time_secs: default_max_processing_time_secs(),
            missing_events_limit: default_missing_events_limit(),
            room_queue_capacity: default_room_queue_capacity(),
            room_worker_idle_secs: default_room_worker_idle_secs(),
        }
    }
}

impl Default for RoomServerConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            log: default_log(),
            input: InputConfig::default(),
        }
    }
}

impl InputConfig {
    pub fn max_processing_time(&self) -> Duration {
        Duration::from_secs(self.max_processing_time_secs)
    }

    pub fn room_worker_idle(&self) -> Duration {
        Duration::from_secs(self.room_worker_idle_secs)
    }
}

impl RoomServerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(MatrixonError::Config("server_name cannot be empty".to_owned()));
        }
        if ruma::ServerName::parse(self.server_name.as_str()).is_err() {
            return Err(MatrixonError::Config(format!(
                "server_name {:?} is not a valid server name",
                self.server_name
            )));
        }
        if self.input.max_processing_time_secs == 0 {
            return Err(MatrixonError::Config(
                "input.max_processing_time_secs must be positive".to_owned(),
            ));
        }
        if self.input.missing_events_limit == 0 {
            return Err(MatrixonError::Config(
                "input.missing_events_limit must be positive".to_owned(),
            ));
        }
        if self.input.room_queue_capacity == 0 {
            return Err(MatrixonError::Config(
                "input.room_queue_capacity must be positive".to_owned(),
            ));
        }
        if self.input.room_worker_idle_secs == 0 {
            return Err(MatrixonError::Config(
                "input.room_worker_idle_secs must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
