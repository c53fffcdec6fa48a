//! Control message types exchanged between the CLI and the supervisor.
//!
//! Each message is serialized as a single JSON value on its own line (see
//! [`crate::framing`]). A connection carries any number of request/response
//! pairs until the client sends [`ControlRequest::Subscribe`], after which the
//! supervisor only writes [`ControlResponse::Event`] lines.

use serde::{Deserialize, Serialize};

use crate::state::{ServerAddress, ServerState};

/// Requests that can be sent from the CLI to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlRequest {
    /// Check if the supervisor is alive.
    Ping,
    /// Get the current engine status.
    Status,
    /// Start the engine if it is not already running.
    Start,
    /// Stop the engine.
    Stop {
        /// Maximum time to wait for a graceful shutdown, in milliseconds.
        /// `None` uses the configured default.
        timeout_ms: Option<u64>,
    },
    /// Stop when running, start otherwise.
    Toggle,
    /// Replace the admin password, starting the engine first if needed.
    SetAdminPassword {
        password: String,
    },
    /// Look up the engine's admin username.
    AdminUser,
    /// Turn this connection into a status event stream.
    Subscribe,
    /// Stop the engine and shut the supervisor down.
    Quit,
}

/// Responses sent from the supervisor to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlResponse {
    /// Response to a Ping request.
    Pong,
    /// Current engine status.
    Status {
        state: ServerState,
        address: Option<ServerAddress>,
        /// Whether any engine listener currently accepts connections.
        running: bool,
        /// Seconds since the engine entered the running state.
        uptime_secs: u64,
    },
    /// The engine is running at the given address.
    Started {
        address: ServerAddress,
    },
    /// The engine has been stopped.
    Stopped,
    AdminUser {
        username: String,
    },
    PasswordUpdated,
    /// Acknowledgment of a Subscribe request; events follow.
    Subscribed,
    /// A status event pushed to a subscribed connection.
    Event(StatusEvent),
    /// Acknowledgment that the supervisor is shutting down.
    Quitting,
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Status change notifications fanned out to every listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StatusEvent {
    /// The engine moved to a new lifecycle state.
    StateChanged {
        state: ServerState,
        /// Reachable address while running.
        address: Option<ServerAddress>,
    },
    /// A newer release was found by the update checker.
    UpdateAvailable(UpdateInfo),
}

/// Description of an available release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateInfo {
    /// Release version without the leading `v`.
    pub version: String,
    /// Version of the bundled AList engine, when the release names one.
    pub engine_version: Option<String>,
    /// Release notes.
    pub changelog: String,
    /// Download links, mirror first. Never more than two.
    pub download_urls: Vec<String>,
}
