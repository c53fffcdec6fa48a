//! The AList engine as seen by the supervisor.
//!
//! The supervisor never talks to the engine directly; it goes through the
//! [`Engine`] trait so the lifecycle logic can be driven by the real child
//! process ([`ProcessEngine`]) or by a test double.

pub mod config;
pub mod net;
pub mod process;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use alistlite_protocol::Scheme;
use thiserror::Error;
use tokio::sync::mpsc;

pub use config::{ConfigAccessor, ConfigReadError, ConfigWriteError, ListenerConfig};
pub use process::ProcessEngine;

/// Asynchronous notifications raised by the engine outside of any call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A listener failed to come up after the engine started.
    StartError { scheme: Scheme, message: String },
    /// The engine process went away.
    Exited { code: Option<i32> },
}

/// Channel the engine uses to deliver [`EngineEvent`]s.
pub type EngineEvents = mpsc::UnboundedSender<EngineEvent>;

/// Errors reported by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine not initialized")]
    NotInitialized,

    #[error("engine binary not found: {0}")]
    BinaryNotFound(String),

    #[error("failed to spawn engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("engine failed to start: {0}")]
    StartFailed(String),

    #[error("engine did not exit within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("engine command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("engine API error: {0}")]
    Api(String),

    #[error("engine HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Config(#[from] ConfigReadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations the supervisor needs from the engine.
///
/// Methods return `Send` futures so a supervisor generic over the engine can
/// be driven from spawned tasks.
pub trait Engine: Send + Sync + 'static {
    /// Prepare the engine to run from `data_dir`. Called before every start.
    fn init(
        &self,
        data_dir: &Path,
        events: EngineEvents,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Bring up the engine's listeners.
    fn start(&self) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Stop the engine, waiting at most `timeout`.
    fn shutdown(&self, timeout: Duration) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Whether the listener for `scheme` is accepting connections.
    fn is_running(&self, scheme: Scheme) -> impl Future<Output = bool> + Send;

    fn set_admin_password(&self, password: &str)
        -> impl Future<Output = Result<(), EngineError>> + Send;

    /// The admin account's username.
    fn admin_user(&self) -> impl Future<Output = Result<String, EngineError>> + Send;

    /// Mount a local directory as a storage at `mount_path`.
    fn add_local_storage(
        &self,
        local_path: &Path,
        mount_path: &str,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// The host's outbound IPv4 address as text.
    fn outbound_ip(&self) -> String;
}
