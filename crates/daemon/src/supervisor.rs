//! Engine lifecycle controller.
//!
//! The [`Supervisor`] owns the engine and is the only component allowed to
//! start or stop it. All lifecycle operations (start, stop, password changes)
//! serialize on a single async lock, so at most one of them touches the engine
//! at a time. Start requests that queue up behind an in-flight start receive
//! that start's outcome instead of starting again; a stop clears the recorded
//! outcome so the next start runs for real.
//!
//! Stopping is fail-open: whatever the engine does during shutdown, the
//! supervisor ends up `Stopped` with its keep-alive released.
//!
//! State changes are published on a [`StatusBroadcaster`]. The supervisor
//! never holds references to its observers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alistlite_protocol::{Scheme, ServerAddress, ServerState, StatusEvent};
use anyhow::Context;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broadcast::{StatusBroadcaster, Subscription};
use crate::config::Config;
use crate::engine::{ConfigAccessor, Engine, EngineError, EngineEvent, EngineEvents};
use crate::flags::{FlagStore, INITIALIZED_FLAG};
use crate::keepalive::KeepAlive;
use crate::permissions;

/// Extra time allowed on top of the shutdown timeout for the engine to
/// finish killing a process that ignored the graceful request.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// A start attempt failed. The message is suitable for display.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to start engine: {0}")]
pub struct StartError(pub String);

/// Problems during shutdown. These are logged, never returned.
#[derive(Debug, Error)]
pub enum StopError {
    #[error("engine shutdown failed: {0}")]
    Engine(#[from] EngineError),

    #[error("engine shutdown did not finish within {0:?}")]
    Timeout(Duration),
}

/// Errors from supervisor operations other than start and stop.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("password must not be blank")]
    BlankPassword,

    #[error(transparent)]
    Start(#[from] StartError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Outcome of [`Supervisor::toggle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toggled {
    Started(ServerAddress),
    Stopped,
}

/// Settings the supervisor needs from the configuration.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub data_dir: PathBuf,
    pub storage_path: PathBuf,
    pub mount_path: String,
    pub admin_password: String,
    /// Default graceful shutdown budget.
    pub shutdown_timeout: Duration,
    pub stop_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_dir: config.daemon.data_dir.clone(),
            storage_path: config.bootstrap.storage_path.clone(),
            mount_path: config.bootstrap.mount_path.clone(),
            admin_password: config.bootstrap.admin_password.clone(),
            shutdown_timeout: config.engine.shutdown_timeout(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Default)]
struct Status {
    state: ServerState,
    address: Option<ServerAddress>,
    running_since: Option<Instant>,
}

/// State guarded by the lifecycle lock.
#[derive(Debug, Default)]
struct Lifecycle {
    /// Outcome of the most recent start attempt since the last stop.
    last_start: Option<Result<ServerAddress, StartError>>,
    initialized: bool,
}

/// Lifecycle controller for one engine.
pub struct Supervisor<E: Engine> {
    engine: E,
    settings: SupervisorSettings,
    engine_config: ConfigAccessor,
    flags: FlagStore,
    keepalive: Box<dyn KeepAlive>,
    broadcaster: StatusBroadcaster,
    status: RwLock<Status>,
    lifecycle: Mutex<Lifecycle>,
    /// Number of start attempts that ran to completion.
    start_completions: AtomicU64,
    events_tx: EngineEvents,
}

impl<E: Engine> Supervisor<E> {
    /// Creates the supervisor and its engine event watcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        engine: E,
        settings: SupervisorSettings,
        flags: FlagStore,
        keepalive: Box<dyn KeepAlive>,
    ) -> Arc<Self> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            engine,
            engine_config: ConfigAccessor::new(&settings.data_dir),
            settings,
            flags,
            keepalive,
            broadcaster: StatusBroadcaster::new(),
            status: RwLock::new(Status::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            start_completions: AtomicU64::new(0),
            events_tx,
        });

        let weak = Arc::downgrade(&supervisor);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(supervisor) = weak.upgrade() else {
                    break;
                };
                supervisor.on_engine_event(event).await;
            }
            debug!("Engine event watcher finished");
        });

        supervisor
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// The engine's `config.json`.
    pub fn engine_config(&self) -> &ConfigAccessor {
        &self.engine_config
    }

    pub fn broadcaster(&self) -> StatusBroadcaster {
        self.broadcaster.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub async fn state(&self) -> ServerState {
        self.status.read().await.state.clone()
    }

    /// Reachable address while running.
    pub async fn address(&self) -> Option<ServerAddress> {
        self.status.read().await.address.clone()
    }

    /// Time since the engine entered the running state.
    pub async fn uptime(&self) -> Option<Duration> {
        self.status
            .read()
            .await
            .running_since
            .map(|since| since.elapsed())
    }

    /// Whether any engine listener accepts connections. Never waits on the
    /// lifecycle lock.
    pub async fn is_running(&self) -> bool {
        for scheme in Scheme::ALL {
            if self.engine.is_running(scheme).await {
                return true;
            }
        }
        false
    }

    /// Start the engine, or return the address it is already serving at.
    pub async fn start(&self) -> Result<ServerAddress, StartError> {
        let seen = self.start_completions.load(Ordering::SeqCst);
        let mut lifecycle = self.lifecycle.lock().await;

        // An attempt finished while we waited for the lock: it was concurrent
        // with this call, so share its result.
        if self.start_completions.load(Ordering::SeqCst) > seen {
            if let Some(outcome) = &lifecycle.last_start {
                debug!("Joining outcome of concurrent start");
                return outcome.clone();
            }
        }

        self.start_locked(&mut lifecycle).await
    }

    /// Stop the engine, waiting at most `timeout` for a graceful exit.
    ///
    /// Always leaves the supervisor stopped with keep-alive released.
    pub async fn stop(&self, timeout: Duration) {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.last_start = None;
        self.stop_locked(timeout).await;
    }

    /// Stop with the configured default timeout.
    pub async fn stop_default(&self) {
        self.stop(self.settings.shutdown_timeout).await;
    }

    /// Stop when running, start otherwise.
    pub async fn toggle(&self) -> Result<Toggled, StartError> {
        if self.state().await.is_running() {
            self.stop_default().await;
            Ok(Toggled::Stopped)
        } else {
            self.start().await.map(Toggled::Started)
        }
    }

    /// Replace the admin password, starting the engine first if needed.
    pub async fn set_admin_password(&self, password: &str) -> Result<(), SupervisorError> {
        if password.trim().is_empty() {
            return Err(SupervisorError::BlankPassword);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        self.start_locked(&mut lifecycle).await?;
        self.engine.set_admin_password(password).await?;
        info!("Admin password changed");
        Ok(())
    }

    /// The engine's admin username.
    pub async fn admin_user(&self) -> Result<String, SupervisorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.ensure_init(&mut lifecycle).await?;
        Ok(self.engine.admin_user().await?)
    }

    async fn ensure_init(&self, lifecycle: &mut Lifecycle) -> Result<(), EngineError> {
        if !lifecycle.initialized {
            self.engine
                .init(&self.settings.data_dir, self.events_tx.clone())
                .await?;
            lifecycle.initialized = true;
        }
        Ok(())
    }

    async fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<ServerAddress, StartError> {
        if self.state().await.is_running() {
            if self.is_running().await {
                if let Some(address) = self.address().await {
                    return Ok(address);
                }
                let address = self.compute_address().map_err(|e| StartError(format!("{:#}", e)))?;
                self.status.write().await.address = Some(address.clone());
                return Ok(address);
            }
            warn!("Engine is no longer serving, restarting it");
            self.stop_locked(self.settings.shutdown_timeout).await;
        }

        self.set_state(ServerState::Starting, None).await;
        info!("Starting engine");

        let outcome = match self.bring_up(lifecycle).await {
            Ok(address) => {
                self.keepalive.acquire(&address);
                {
                    let mut status = self.status.write().await;
                    status.running_since = Some(Instant::now());
                }
                self.set_state(ServerState::Running, Some(address.clone())).await;
                info!("Engine running at {}", address);
                Ok(address)
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("Engine start failed: {}", reason);
                self.shutdown_engine(self.settings.shutdown_timeout).await;
                self.keepalive.release();
                self.set_state(ServerState::Failed(reason.clone()), None).await;
                self.set_state(ServerState::Stopped, None).await;
                Err(StartError(reason))
            }
        };

        lifecycle.last_start = Some(outcome.clone());
        self.start_completions.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn bring_up(&self, lifecycle: &mut Lifecycle) -> anyhow::Result<ServerAddress> {
        // Re-initialize on every start so the engine sees the current data dir
        lifecycle.initialized = false;
        self.ensure_init(lifecycle)
            .await
            .context("engine initialization failed")?;
        self.engine.start().await?;
        self.bootstrap_if_needed().await?;
        self.compute_address()
    }

    /// First-run setup, applied once per flag store.
    async fn bootstrap_if_needed(&self) -> anyhow::Result<()> {
        if self.flags.get_bool(INITIALIZED_FLAG, false)? {
            return Ok(());
        }

        info!("First start: applying default admin password and storage");
        self.engine
            .set_admin_password(&self.settings.admin_password)
            .await
            .context("failed to set the default admin password")?;

        let storage = &self.settings.storage_path;
        if permissions::storage_readable(storage) {
            if let Err(e) = self
                .engine
                .add_local_storage(storage, &self.settings.mount_path)
                .await
            {
                warn!("Failed to mount {:?} at {}: {}", storage, self.settings.mount_path, e);
            }
        } else {
            warn!(
                "Permission denied reading {:?}, skipping default storage mount",
                storage
            );
        }

        let username = match self.engine.admin_user().await {
            Ok(name) => name,
            Err(e) => {
                debug!("Could not query admin user: {}", e);
                "admin".to_string()
            }
        };
        info!(
            "Initial login is `{}` with the password from bootstrap.admin_password",
            username
        );

        self.flags.set_bool(INITIALIZED_FLAG, true)?;
        Ok(())
    }

    fn compute_address(&self) -> anyhow::Result<ServerAddress> {
        let ip = self.engine.outbound_ip();
        self.engine_config
            .server_address(&ip)
            .context("cannot determine the server address")
    }

    async fn stop_locked(&self, timeout: Duration) {
        if self.state().await == ServerState::Stopped && !self.is_running().await {
            debug!("Stop requested while already stopped");
            self.keepalive.release();
            return;
        }

        self.set_state(ServerState::Stopping, None).await;
        info!("Stopping engine");
        self.shutdown_engine(timeout).await;

        self.keepalive.release();
        self.status.write().await.running_since = None;
        self.set_state(ServerState::Stopped, None).await;
        info!("Engine stopped");
    }

    /// Ask the engine to shut down, logging instead of propagating failures.
    async fn shutdown_engine(&self, timeout: Duration) {
        let bound = timeout + self.settings.stop_grace;
        let result = match tokio::time::timeout(bound, self.engine.shutdown(timeout)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StopError::Engine(e)),
            Err(_) => Err(StopError::Timeout(bound)),
        };
        if let Err(e) = result {
            warn!("{}", e);
        }
    }

    async fn set_state(&self, state: ServerState, address: Option<ServerAddress>) {
        {
            let mut status = self.status.write().await;
            status.state = state.clone();
            status.address = address.clone();
        }
        self.broadcaster
            .publish(StatusEvent::StateChanged { state, address });
    }

    async fn on_engine_event(&self, event: EngineEvent) {
        match &event {
            EngineEvent::Exited { code } => debug!("Engine exited with {:?}", code),
            EngineEvent::StartError { scheme, message } => {
                warn!("Engine {} listener failed: {}", scheme, message)
            }
        }

        self.reconcile().await;
    }

    /// Tear down if the state says running but no listener answers.
    ///
    /// Returns `true` if a teardown happened.
    pub async fn reconcile(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state().await.is_running() && !self.is_running().await {
            warn!("Engine stopped serving unexpectedly");
            lifecycle.last_start = None;
            self.stop_locked(self.settings.shutdown_timeout).await;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.engine.shutdown_timeout_ms = 1_500;
        config.bootstrap.mount_path = "/share".to_string();

        let settings = SupervisorSettings::from_config(&config);
        assert_eq!(settings.shutdown_timeout, Duration::from_millis(1_500));
        assert_eq!(settings.mount_path, "/share");
        assert_eq!(settings.data_dir, config.daemon.data_dir);
        assert_eq!(settings.stop_grace, DEFAULT_STOP_GRACE);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            StartError("port in use".into()).to_string(),
            "failed to start engine: port in use"
        );
        assert_eq!(
            SupervisorError::BlankPassword.to_string(),
            "password must not be blank"
        );
    }
}
