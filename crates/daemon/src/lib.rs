//! # AListLite Supervisor Library
//!
//! Lifecycle supervision for the AList file-server engine: start and stop it,
//! apply first-run defaults, report its state to observers and check for
//! newer releases.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         CLI / IPC                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                     Supervisor                         │  │
//! │  │  lifecycle lock · bootstrap · fail-open stop           │  │
//! │  └──────┬───────────────┬───────────────┬────────────────┘  │
//! │         │               │               │                   │
//! │  ┌──────┴─────┐  ┌──────┴──────┐  ┌─────┴──────┐  ┌───────┐ │
//! │  │   Engine   │  │  FlagStore  │  │ KeepAlive  │  │ Broad-│ │
//! │  │ (process)  │  │             │  │ (systemd)  │  │ caster│ │
//! │  └──────┬─────┘  └─────────────┘  └────────────┘  └───────┘ │
//! │         │                                                    │
//! │  ┌──────┴─────────────┐   ┌──────────────────────────────┐   │
//! │  │  Config Accessor   │   │        Update Checker        │   │
//! │  │  (config.json)     │   │                              │   │
//! │  └────────────────────┘   └──────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use alistlite_daemon::{
//!     Config, FlagStore, ProcessEngine, Supervisor, SupervisorSettings, SystemdKeepAlive,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let supervisor = Supervisor::new(
//!         ProcessEngine::new(&config.engine),
//!         SupervisorSettings::from_config(&config),
//!         FlagStore::open(config.state_dir())?,
//!         Box::new(SystemdKeepAlive::new()),
//!     );
//!
//!     let address = supervisor.start().await?;
//!     println!("Serving at {}", address);
//!
//!     supervisor.stop_default().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`supervisor`]: Lifecycle controller
//! - [`engine`]: Engine interface, process implementation, `config.json` access
//! - [`flags`]: Persistent boolean flags
//! - [`broadcast`]: Status event fan-out
//! - [`keepalive`]: Resources held while serving
//! - [`update`]: Release checking
//! - [`permissions`]: Host permission inspection
//! - [`ipc`]: Control socket server and client
//! - [`systemd`]: sd_notify integration and unit file generation
//! - [`config`]: Supervisor configuration

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod flags;
pub mod ipc;
pub mod keepalive;
pub mod permissions;
pub mod supervisor;
pub mod systemd;
pub mod update;

// Re-export protocol for convenience
pub use alistlite_protocol as protocol;

pub use broadcast::{LogListener, StatusBroadcaster, StatusListener, Subscription};
pub use config::Config;
pub use engine::{
    ConfigAccessor, ConfigReadError, ConfigWriteError, Engine, EngineError, EngineEvent,
    ProcessEngine,
};
pub use flags::FlagStore;
pub use keepalive::{KeepAlive, SystemdKeepAlive};
pub use permissions::PermissionItem;
pub use supervisor::{StartError, StopError, Supervisor, SupervisorError, SupervisorSettings, Toggled};
pub use update::{UpdateChecker, UpdateError};
