//! Systemd integration for the supervisor.
//!
//! This module provides:
//! - Detection of a systemd environment
//! - sd_notify messages (READY, STATUS, STOPPING, WATCHDOG)
//! - Watchdog interval discovery from `WATCHDOG_USEC` and a ping task
//! - Unit file generation for installation
//! - A shutdown signal future for SIGTERM and Ctrl-C
//!
//! Every notification is a no-op when `NOTIFY_SOCKET` is not set.

use std::env;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable name for the systemd notification socket.
const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Environment variable carrying the watchdog timeout in microseconds.
const WATCHDOG_USEC_ENV: &str = "WATCHDOG_USEC";

/// Check if the supervisor is running under systemd.
pub fn is_systemd() -> bool {
    env::var(NOTIFY_SOCKET_ENV).is_ok()
}

/// Get the path to the systemd notification socket.
///
/// Returns `None` if not running under systemd or if the socket path is invalid.
fn get_notify_socket_path() -> Option<PathBuf> {
    let socket_path = env::var(NOTIFY_SOCKET_ENV).ok()?;

    // Abstract namespace (@) or a regular path
    if socket_path.starts_with('@') || socket_path.starts_with('/') {
        Some(PathBuf::from(socket_path))
    } else {
        warn!("Invalid NOTIFY_SOCKET path: {}", socket_path);
        None
    }
}

/// Send a raw `KEY=VALUE\n` notification to systemd.
fn notify(message: &str) -> io::Result<()> {
    let socket_path = match get_notify_socket_path() {
        Some(path) => path,
        None => {
            debug!("Not running under systemd, skipping notification");
            return Ok(());
        }
    };

    let socket = UnixDatagram::unbound()?;

    let actual_path = if socket_path.to_string_lossy().starts_with('@') {
        let path_str = socket_path.to_string_lossy();
        PathBuf::from(format!("\0{}", &path_str[1..]))
    } else {
        socket_path
    };

    socket.send_to(message.as_bytes(), &actual_path)?;

    debug!("Sent systemd notification: {}", message.trim());
    Ok(())
}

/// Notify systemd that the supervisor finished starting up.
pub fn notify_ready() {
    if let Err(e) = notify("READY=1\n") {
        error!("Failed to notify systemd of ready state: {}", e);
    } else {
        info!("Notified systemd: service ready");
    }
}

/// Send a status line shown by `systemctl status`.
pub fn notify_status(message: &str) {
    let notification = format!("STATUS={}\n", message);
    if let Err(e) = notify(&notification) {
        error!("Failed to notify systemd of status: {}", e);
    } else {
        debug!("Notified systemd: STATUS={}", message);
    }
}

/// Notify systemd that shutdown has begun.
pub fn notify_stopping() {
    if let Err(e) = notify("STOPPING=1\n") {
        error!("Failed to notify systemd of stopping state: {}", e);
    } else {
        info!("Notified systemd: service stopping");
    }
}

/// Reset the systemd watchdog timer.
pub fn notify_watchdog() {
    if let Err(e) = notify("WATCHDOG=1\n") {
        error!("Failed to send watchdog keepalive: {}", e);
    } else {
        debug!("Sent watchdog keepalive");
    }
}

/// Interval at which watchdog pings should be sent, if systemd expects them.
///
/// This is half of `WATCHDOG_USEC`, as recommended by sd_watchdog_enabled(3).
pub fn watchdog_interval() -> Option<Duration> {
    let usec: u64 = env::var(WATCHDOG_USEC_ENV).ok()?.trim().parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec / 2))
}

/// Feed the systemd watchdog until `shutdown` is cancelled.
///
/// The pings cover the supervisor itself, so they continue while the engine
/// is stopped. Returns `None` when systemd does not expect watchdog pings.
pub fn spawn_watchdog(shutdown: CancellationToken) -> Option<JoinHandle<()>> {
    let interval = watchdog_interval()?;
    debug!("Feeding systemd watchdog every {:?}", interval);

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => notify_watchdog(),
            }
        }
        debug!("Watchdog pings stopped");
    }))
}

/// Generate a systemd user unit for the supervisor.
///
/// Save the output to `~/.config/systemd/user/alistlite.service`.
/// `exec_path` defaults to `/usr/bin/alistlite`.
pub fn generate_unit_file(exec_path: Option<&str>) -> String {
    let exec = exec_path.unwrap_or("/usr/bin/alistlite");

    format!(
        r#"[Unit]
Description=AListLite file server supervisor
Documentation=https://github.com/alistlite/alistlite-supervisor
After=network-online.target
Wants=network-online.target

[Service]
Type=notify
ExecStart={} serve --systemd
Restart=on-failure
RestartSec=5
TimeoutStartSec=60
TimeoutStopSec=30
WatchdogSec=60

# Security hardening
NoNewPrivileges=yes
PrivateTmp=yes
ProtectKernelTunables=yes
ProtectKernelModules=yes
ProtectControlGroups=yes

RestrictAddressFamilies=AF_UNIX AF_INET AF_INET6

[Install]
WantedBy=default.target
"#,
        exec
    )
}

/// Resolves when the process receives SIGTERM or Ctrl-C.
pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to register SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    // SAFETY: env mutation is serialized with #[serial]
    unsafe fn set_env(key: &str, value: &str) {
        unsafe { env::set_var(key, value) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { env::remove_var(key) };
    }

    #[test]
    #[serial]
    fn test_is_systemd_without_env() {
        unsafe { remove_env(NOTIFY_SOCKET_ENV) };
        assert!(!is_systemd());
    }

    #[test]
    #[serial]
    fn test_is_systemd_with_env() {
        unsafe { set_env(NOTIFY_SOCKET_ENV, "/run/systemd/notify") };
        assert!(is_systemd());
        unsafe { remove_env(NOTIFY_SOCKET_ENV) };
    }

    #[test]
    #[serial]
    fn test_notify_socket_path_variants() {
        unsafe { set_env(NOTIFY_SOCKET_ENV, "@/run/systemd/notify") };
        assert_eq!(
            get_notify_socket_path(),
            Some(PathBuf::from("@/run/systemd/notify"))
        );

        unsafe { set_env(NOTIFY_SOCKET_ENV, "relative/path") };
        assert!(get_notify_socket_path().is_none());

        unsafe { remove_env(NOTIFY_SOCKET_ENV) };
    }

    #[test]
    #[serial]
    fn test_notify_without_systemd_is_noop() {
        unsafe { remove_env(NOTIFY_SOCKET_ENV) };
        assert!(notify("READY=1\n").is_ok());
    }

    #[test]
    #[serial]
    fn test_notify_reaches_socket() {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&socket_path).unwrap();

        unsafe { set_env(NOTIFY_SOCKET_ENV, socket_path.to_str().unwrap()) };
        notify_status("Serving at http://10.0.0.2:5244");
        unsafe { remove_env(NOTIFY_SOCKET_ENV) };

        let mut buf = [0u8; 256];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            "STATUS=Serving at http://10.0.0.2:5244\n"
        );
    }

    #[test]
    #[serial]
    fn test_watchdog_interval() {
        unsafe { remove_env(WATCHDOG_USEC_ENV) };
        assert_eq!(watchdog_interval(), None);

        unsafe { set_env(WATCHDOG_USEC_ENV, "60000000") };
        assert_eq!(watchdog_interval(), Some(Duration::from_secs(30)));

        unsafe { set_env(WATCHDOG_USEC_ENV, "0") };
        assert_eq!(watchdog_interval(), None);

        unsafe { remove_env(WATCHDOG_USEC_ENV) };
    }

    #[test]
    fn test_unit_file() {
        let unit = generate_unit_file(Some("/opt/alistlite/bin/alistlite"));
        assert!(unit.contains("ExecStart=/opt/alistlite/bin/alistlite serve --systemd"));
        assert!(unit.contains("Type=notify"));
        assert!(unit.contains("WatchdogSec="));

        let default = generate_unit_file(None);
        assert!(default.contains("ExecStart=/usr/bin/alistlite serve --systemd"));
    }
}
