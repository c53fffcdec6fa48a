//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alistlite_daemon::engine::{Engine, EngineError, EngineEvent, EngineEvents};
use alistlite_daemon::protocol::{Scheme, ServerAddress};
use alistlite_daemon::{FlagStore, KeepAlive, Supervisor, SupervisorSettings};
use tempfile::TempDir;

pub const MOCK_IP: &str = "192.168.1.20";
pub const MOCK_PORT: u16 = 5244;

/// Observable state behind a [`MockEngine`].
#[derive(Default)]
pub struct MockState {
    pub init_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
    pub start_delay_ms: AtomicU64,
    pub fail_start: AtomicBool,
    pub fail_shutdown: AtomicBool,
    pub hang_shutdown: AtomicBool,
    pub fail_password: AtomicBool,
    pub fail_mount: AtomicBool,
    pub http: AtomicBool,
    pub https: AtomicBool,
    pub unix: AtomicBool,
    /// Listener `start` brings up.
    pub serve_scheme: Mutex<Option<Scheme>>,
    pub passwords: Mutex<Vec<String>>,
    pub mounts: Mutex<Vec<(PathBuf, String)>>,
    pub events: Mutex<Option<EngineEvents>>,
}

impl MockState {
    fn flag(&self, scheme: Scheme) -> &AtomicBool {
        match scheme {
            Scheme::Http => &self.http,
            Scheme::Https => &self.https,
            Scheme::Unix => &self.unix,
        }
    }

    pub fn set_serving(&self, scheme: Scheme, serving: bool) {
        self.flag(scheme).store(serving, Ordering::SeqCst);
    }

    pub fn clear_serving(&self) {
        for scheme in Scheme::ALL {
            self.set_serving(scheme, false);
        }
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn passwords(&self) -> Vec<String> {
        self.passwords.lock().unwrap().clone()
    }

    pub fn mounts(&self) -> Vec<(PathBuf, String)> {
        self.mounts.lock().unwrap().clone()
    }

    /// Deliver an engine event the way a real engine would.
    pub fn emit(&self, event: EngineEvent) {
        let events = self.events.lock().unwrap().clone();
        events.expect("engine not initialized").send(event).unwrap();
    }
}

/// Scriptable engine that serves nothing but records every call.
#[derive(Clone, Default)]
pub struct MockEngine {
    pub state: Arc<MockState>,
}

impl Engine for MockEngine {
    async fn init(&self, data_dir: &Path, events: EngineEvents) -> Result<(), EngineError> {
        assert!(data_dir.is_dir(), "data dir must exist before init");
        self.state.init_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        self.state.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::StartFailed("port 5244 already in use".into()));
        }
        let scheme = self.state.serve_scheme.lock().unwrap().unwrap_or(Scheme::Http);
        self.state.set_serving(scheme, true);
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        self.state.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.hang_shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.state.clear_serving();
        if self.state.fail_shutdown.load(Ordering::SeqCst) {
            return Err(EngineError::ShutdownTimeout(timeout));
        }
        Ok(())
    }

    async fn is_running(&self, scheme: Scheme) -> bool {
        self.state.flag(scheme).load(Ordering::SeqCst)
    }

    async fn set_admin_password(&self, password: &str) -> Result<(), EngineError> {
        if self.state.fail_password.load(Ordering::SeqCst) {
            return Err(EngineError::Command {
                command: "admin set".into(),
                message: "database is locked".into(),
            });
        }
        self.state.passwords.lock().unwrap().push(password.to_string());
        Ok(())
    }

    async fn admin_user(&self) -> Result<String, EngineError> {
        Ok("admin".to_string())
    }

    async fn add_local_storage(&self, local_path: &Path, mount_path: &str) -> Result<(), EngineError> {
        if self.state.fail_mount.load(Ordering::SeqCst) {
            return Err(EngineError::Api("storage already exists".into()));
        }
        self.state
            .mounts
            .lock()
            .unwrap()
            .push((local_path.to_path_buf(), mount_path.to_string()));
        Ok(())
    }

    fn outbound_ip(&self) -> String {
        MOCK_IP.to_string()
    }
}

/// Keep-alive that only counts.
#[derive(Clone, Default)]
pub struct RecordingKeepAlive {
    pub held: Arc<AtomicBool>,
    pub acquired: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl KeepAlive for RecordingKeepAlive {
    fn acquire(&self, _address: &ServerAddress) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.held.store(false, Ordering::SeqCst);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// A supervisor over a [`MockEngine`] in a temporary directory.
pub struct Harness {
    pub supervisor: Arc<Supervisor<MockEngine>>,
    pub engine: Arc<MockState>,
    pub keepalive: RecordingKeepAlive,
    pub settings: SupervisorSettings,
}

impl Harness {
    pub fn new(dir: &TempDir) -> Self {
        Self::with_settings(settings(dir))
    }

    pub fn with_settings(settings: SupervisorSettings) -> Self {
        let engine = MockEngine::default();
        let state = Arc::clone(&engine.state);
        let keepalive = RecordingKeepAlive::default();
        let flags = FlagStore::open(settings.data_dir.join("supervisor")).unwrap();
        let supervisor = Supervisor::new(
            engine,
            settings.clone(),
            flags,
            Box::new(keepalive.clone()),
        );
        Self {
            supervisor,
            engine: state,
            keepalive,
            settings,
        }
    }

    pub fn expected_address(&self) -> ServerAddress {
        ServerAddress::new(Scheme::Http, MOCK_IP, MOCK_PORT)
    }
}

/// Settings rooted in `dir`, with an engine config.json and a readable
/// storage directory already in place.
pub fn settings(dir: &TempDir) -> SupervisorSettings {
    let data_dir = dir.path().join("data");
    let storage_path = dir.path().join("storage");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::create_dir_all(&storage_path).unwrap();
    std::fs::write(
        data_dir.join("config.json"),
        r#"{
  "site_url": "",
  "scheme": {
    "address": "0.0.0.0",
    "http_port": 5244,
    "https_port": -1,
    "force_https": false,
    "unix_file": ""
  }
}"#,
    )
    .unwrap();

    SupervisorSettings {
        data_dir,
        storage_path,
        mount_path: "/本地存储".to_string(),
        admin_password: "admin".to_string(),
        shutdown_timeout: Duration::from_millis(200),
        stop_grace: Duration::from_millis(100),
    }
}
