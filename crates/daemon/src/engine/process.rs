//! Engine implementation backed by an AList-compatible executable.
//!
//! The engine runs as `<binary> server --data <data_dir>` in its own process.
//! A monitor task owns the child and publishes its exit status through a
//! watch channel, so liveness checks never need the child handle. Engine
//! output is forwarded line by line to `tracing` under the `engine` target.
//!
//! Admin operations use the executable's `admin` subcommands. Storage
//! mounting goes through the engine's HTTP API, which requires the admin
//! password set earlier in the same supervisor run.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use alistlite_protocol::Scheme;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};

use super::config::{ConfigAccessor, ListenerConfig};
use super::{net, Engine, EngineError, EngineEvent, EngineEvents};
use crate::config::EngineConfig;

/// Interval between readiness checks while starting.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Budget for a single liveness dial.
const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period after SIGKILL before giving up on reaping.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Username reported when the engine does not name its admin.
pub const DEFAULT_ADMIN_USER: &str = "admin";

/// A spawned engine process.
#[derive(Debug)]
struct RunningChild {
    pid: u32,
    /// `Some(code)` once the process has exited.
    exit: watch::Receiver<Option<Option<i32>>>,
}

impl RunningChild {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[derive(Debug, Default)]
struct Inner {
    data_dir: Option<PathBuf>,
    binary: Option<PathBuf>,
    events: Option<EngineEvents>,
    child: Option<RunningChild>,
    admin_password: Option<String>,
}

/// Runs the engine as a child process.
pub struct ProcessEngine {
    binary: String,
    startup_timeout: Duration,
    http: reqwest::Client,
    inner: Mutex<Inner>,
}

impl ProcessEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            startup_timeout: config.startup_timeout(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// PID of the engine process, if one is alive.
    pub async fn pid(&self) -> Option<u32> {
        let inner = self.inner.lock().await;
        inner
            .child
            .as_ref()
            .filter(|c| !c.has_exited())
            .map(|c| c.pid)
    }

    async fn paths(&self) -> Result<(PathBuf, PathBuf), EngineError> {
        let inner = self.inner.lock().await;
        match (&inner.binary, &inner.data_dir) {
            (Some(bin), Some(dir)) => Ok((bin.clone(), dir.clone())),
            _ => Err(EngineError::NotInitialized),
        }
    }

    async fn listeners(&self) -> Result<ListenerConfig, EngineError> {
        let (_, data_dir) = self.paths().await?;
        Ok(ConfigAccessor::new(&data_dir).listeners()?)
    }

    /// Run an `admin` subcommand and return its combined output.
    async fn admin_command(&self, args: &[&str]) -> Result<String, EngineError> {
        let (binary, data_dir) = self.paths().await?;
        let output = Command::new(&binary)
            .arg("admin")
            .args(args)
            .arg("--data")
            .arg(&data_dir)
            .current_dir(&data_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(EngineError::Spawn)?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            let command = format!("admin {}", args.first().copied().unwrap_or_default());
            return Err(EngineError::Command {
                command: command.trim().to_string(),
                message: last_line(&text).unwrap_or("no output").to_string(),
            });
        }
        Ok(text)
    }

    /// Log in over HTTP and return the session token.
    async fn login(
        &self,
        base: &str,
        username: &str,
        password: &str,
    ) -> Result<String, EngineError> {
        let reply: ApiReply<LoginData> = self
            .http
            .post(format!("{}/api/auth/login", base))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await?
            .json()
            .await?;
        reply.into_data("login")?.map(|d| d.token).ok_or_else(|| {
            EngineError::Api("login succeeded without a token".to_string())
        })
    }

    async fn wait_until_ready(
        &self,
        exit: &mut watch::Receiver<Option<Option<i32>>>,
    ) -> Result<(), EngineError> {
        let (_, data_dir) = self.paths().await?;
        let config = ConfigAccessor::new(&data_dir);
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            let exited = *exit.borrow();
            if let Some(code) = exited {
                return Err(EngineError::StartFailed(format!(
                    "engine exited during startup ({})",
                    describe_exit(code)
                )));
            }

            // The engine writes config.json on first run, so it may not exist yet
            if let Ok(listeners) = config.listeners() {
                for scheme in Scheme::ALL {
                    if is_listening(&listeners, &data_dir, scheme).await {
                        tracing::debug!("Engine {} listener is ready", scheme);
                        return Ok(());
                    }
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::StartFailed(format!(
                    "no listener became ready within {:?}",
                    self.startup_timeout
                )));
            }

            tokio::select! {
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
                _ = exit.changed() => {}
            }
        }
    }

    async fn kill_child(child: &mut RunningChild) {
        if let Err(e) = send_signal(child.pid, Signal::SIGKILL) {
            tracing::warn!("Failed to kill engine process {}: {}", child.pid, e);
        }
        let _ = tokio::time::timeout(KILL_GRACE, child.exit.wait_for(Option::is_some)).await;
    }
}

impl Engine for ProcessEngine {
    async fn init(&self, data_dir: &Path, events: EngineEvents) -> Result<(), EngineError> {
        tokio::fs::create_dir_all(data_dir).await?;
        let binary = resolve_binary(&self.binary)?;

        let mut inner = self.inner.lock().await;
        tracing::debug!("Engine initialized: {:?} with data dir {:?}", binary, data_dir);
        inner.binary = Some(binary);
        inner.data_dir = Some(data_dir.to_path_buf());
        inner.events = Some(events);
        Ok(())
    }

    async fn start(&self) -> Result<(), EngineError> {
        let mut exit_rx = {
            let mut inner = self.inner.lock().await;
            if inner.child.as_ref().is_some_and(|c| !c.has_exited()) {
                tracing::debug!("Engine process already running");
                return Ok(());
            }

            let (binary, data_dir) = match (&inner.binary, &inner.data_dir) {
                (Some(b), Some(d)) => (b.clone(), d.clone()),
                _ => return Err(EngineError::NotInitialized),
            };

            let mut child = Command::new(&binary)
                .arg("server")
                .arg("--data")
                .arg(&data_dir)
                .current_dir(&data_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(EngineError::Spawn)?;

            let pid = child
                .id()
                .ok_or_else(|| EngineError::StartFailed("engine exited immediately".to_string()))?;
            tracing::info!("Spawned engine process {} ({:?})", pid, binary);

            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_output(stdout));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_output(stderr));
            }

            let (exit_tx, exit_rx) = watch::channel(None);
            let events = inner.events.clone();
            tokio::spawn(async move {
                let code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(e) => {
                        tracing::error!("Failed to wait for engine process {}: {}", pid, e);
                        None
                    }
                };
                tracing::info!("Engine process {} exited ({})", pid, describe_exit(code));
                let _ = exit_tx.send(Some(code));
                if let Some(events) = events {
                    let _ = events.send(EngineEvent::Exited { code });
                }
            });

            inner.child = Some(RunningChild {
                pid,
                exit: exit_rx.clone(),
            });
            exit_rx
        };

        if let Err(e) = self.wait_until_ready(&mut exit_rx).await {
            let mut inner = self.inner.lock().await;
            if let Some(mut child) = inner.child.take() {
                Self::kill_child(&mut child).await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        let Some(mut child) = self.inner.lock().await.child.take() else {
            return Ok(());
        };
        if child.has_exited() {
            return Ok(());
        }

        tracing::info!("Stopping engine process {}", child.pid);
        if let Err(e) = send_signal(child.pid, Signal::SIGTERM) {
            tracing::warn!("Failed to signal engine process {}: {}", child.pid, e);
        }

        let exited = tokio::time::timeout(timeout, child.exit.wait_for(Option::is_some))
            .await
            .is_ok();
        if exited {
            return Ok(());
        }

        tracing::warn!(
            "Engine process {} ignored SIGTERM for {:?}, killing",
            child.pid,
            timeout
        );
        Self::kill_child(&mut child).await;
        Err(EngineError::ShutdownTimeout(timeout))
    }

    async fn is_running(&self, scheme: Scheme) -> bool {
        let (alive, data_dir) = {
            let inner = self.inner.lock().await;
            let alive = inner.child.as_ref().is_some_and(|c| !c.has_exited());
            (alive, inner.data_dir.clone())
        };
        let Some(data_dir) = data_dir.filter(|_| alive) else {
            return false;
        };
        match ConfigAccessor::new(&data_dir).listeners() {
            Ok(listeners) => is_listening(&listeners, &data_dir, scheme).await,
            Err(_) => false,
        }
    }

    /// Runs `admin set <password>`. The engine CLI takes the password only
    /// as an argument, so it is visible in the process list while the
    /// command runs. The password is never logged.
    async fn set_admin_password(&self, password: &str) -> Result<(), EngineError> {
        self.admin_command(&["set", password]).await?;
        self.inner.lock().await.admin_password = Some(password.to_string());
        tracing::info!("Admin password updated");
        Ok(())
    }

    async fn admin_user(&self) -> Result<String, EngineError> {
        let output = self.admin_command(&[]).await?;
        Ok(parse_admin_user(&output).unwrap_or_else(|| DEFAULT_ADMIN_USER.to_string()))
    }

    async fn add_local_storage(&self, local_path: &Path, mount_path: &str) -> Result<(), EngineError> {
        let listeners = self.listeners().await?;
        let base = api_base(&listeners)
            .ok_or_else(|| EngineError::Api("no HTTP listener configured".to_string()))?;
        let password = self
            .inner
            .lock()
            .await
            .admin_password
            .clone()
            .ok_or_else(|| EngineError::Api("admin password not known".to_string()))?;
        let username = self.admin_user().await?;
        let token = self.login(&base, &username, &password).await?;

        let addition = json!({
            "root_folder_path": local_path.to_string_lossy(),
            "thumbnail": false,
            "thumb_cache_folder": "",
            "show_hidden": true,
            "mkdir_perm": "777",
            "recycle_bin_path": "delete permanently",
        });
        let body = json!({
            "mount_path": mount_path,
            "driver": "Local",
            "order": 0,
            "remark": "",
            "cache_expiration": 30,
            "web_proxy": false,
            "webdav_policy": "native_proxy",
            "down_proxy_url": "",
            "enable_sign": false,
            "addition": addition.to_string(),
        });

        let reply: ApiReply<serde_json::Value> = self
            .http
            .post(format!("{}/api/admin/storage/create", base))
            .header("Authorization", token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        reply.into_data("storage create")?;

        tracing::info!("Mounted {:?} at {}", local_path, mount_path);
        Ok(())
    }

    fn outbound_ip(&self) -> String {
        net::outbound_ip()
    }
}

/// Envelope of every engine API response.
#[derive(Debug, Deserialize)]
struct ApiReply<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

impl<T> ApiReply<T> {
    fn into_data(self, what: &str) -> Result<Option<T>, EngineError> {
        if self.code == 200 {
            Ok(self.data)
        } else {
            Err(EngineError::Api(format!(
                "{} failed with code {}: {}",
                what, self.code, self.message
            )))
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

fn resolve_binary(binary: &str) -> Result<PathBuf, EngineError> {
    let path = Path::new(binary);
    if path.components().count() > 1 {
        if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(EngineError::BinaryNotFound(binary.to_string()))
        }
    } else {
        which::which(binary).map_err(|_| EngineError::BinaryNotFound(binary.to_string()))
    }
}

fn send_signal(pid: u32, signal: Signal) -> nix::Result<()> {
    let pid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    match kill(Pid::from_raw(pid), signal) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if !line.is_empty() {
            tracing::info!(target: "engine", "{}", line);
        }
    }
}

/// Whether the listener for `scheme` accepts a connection right now.
async fn is_listening(listeners: &ListenerConfig, data_dir: &Path, scheme: Scheme) -> bool {
    let attempt = async {
        match scheme {
            Scheme::Http | Scheme::Https => match listeners.port(scheme) {
                Some(port) => TcpStream::connect((listeners.dial_host(), port)).await.is_ok(),
                None => false,
            },
            Scheme::Unix => match &listeners.unix_file {
                Some(file) => UnixStream::connect(data_dir.join(file)).await.is_ok(),
                None => false,
            },
        }
    };
    tokio::time::timeout(DIAL_TIMEOUT, attempt)
        .await
        .unwrap_or(false)
}

fn api_base(listeners: &ListenerConfig) -> Option<String> {
    let port = listeners.port(Scheme::Http)?;
    let host = listeners.dial_host();
    if host.contains(':') {
        Some(format!("http://[{}]:{}", host, port))
    } else {
        Some(format!("http://{}:{}", host, port))
    }
}

/// Extract the admin username from `admin` command output.
fn parse_admin_user(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        let idx = lower.find("username:")?;
        let name = line[idx + "username:".len()..].trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}
