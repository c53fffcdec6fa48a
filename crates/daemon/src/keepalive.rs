//! Resources that keep the host serving while the engine runs.
//!
//! The supervisor acquires a [`KeepAlive`] after a successful start and
//! releases it on every stop path. Implementations must tolerate repeated
//! acquire and release calls.

use std::sync::atomic::{AtomicBool, Ordering};

use alistlite_protocol::ServerAddress;

use crate::systemd;

pub trait KeepAlive: Send + Sync {
    /// Engine is serving at `address`.
    fn acquire(&self, address: &ServerAddress);

    /// Engine is no longer serving.
    fn release(&self);

    fn is_held(&self) -> bool;
}

/// Keep-alive backed by systemd's status line.
///
/// While held, `systemctl status` shows the serving address. The watchdog is
/// not tied to the engine: [`systemd::spawn_watchdog`] feeds it for as long
/// as the supervisor runs, whether or not the engine is up.
#[derive(Default)]
pub struct SystemdKeepAlive {
    held: AtomicBool,
}

impl SystemdKeepAlive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeepAlive for SystemdKeepAlive {
    fn acquire(&self, address: &ServerAddress) {
        systemd::notify_status(&format!("Serving at {}", address));
        if !self.held.swap(true, Ordering::SeqCst) {
            tracing::debug!("Keep-alive acquired for {}", address);
        }
    }

    fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            systemd::notify_status("Engine stopped");
            tracing::debug!("Keep-alive released");
        }
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alistlite_protocol::Scheme;
    use serial_test::serial;
    use std::time::Duration;
    use tokio::net::UnixDatagram;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    #[serial]
    async fn test_acquire_release_idempotent() {
        let keepalive = SystemdKeepAlive::new();
        let address = ServerAddress::new(Scheme::Http, "127.0.0.1", 5244);

        assert!(!keepalive.is_held());
        keepalive.acquire(&address);
        keepalive.acquire(&address);
        assert!(keepalive.is_held());

        keepalive.release();
        keepalive.release();
        assert!(!keepalive.is_held());
    }

    #[tokio::test]
    #[serial]
    async fn test_watchdog_keeps_running_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("notify.sock");
        let receiver = UnixDatagram::bind(&socket_path).unwrap();
        // SAFETY: env mutation is serialized with #[serial]
        unsafe {
            std::env::set_var("NOTIFY_SOCKET", &socket_path);
            std::env::set_var("WATCHDOG_USEC", "100000");
        }

        let shutdown = CancellationToken::new();
        let watchdog = systemd::spawn_watchdog(shutdown.clone()).unwrap();

        let keepalive = SystemdKeepAlive::new();
        keepalive.acquire(&ServerAddress::new(Scheme::Http, "127.0.0.1", 5244));
        keepalive.release();

        let mut buf = [0u8; 256];
        let mut released = false;
        let mut pings_after_release = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while pings_after_release < 3 {
            let n = tokio::time::timeout_at(deadline, receiver.recv(&mut buf))
                .await
                .expect("watchdog pings stopped after release")
                .unwrap();
            match std::str::from_utf8(&buf[..n]).unwrap() {
                "STATUS=Engine stopped\n" => released = true,
                "WATCHDOG=1\n" if released => pings_after_release += 1,
                _ => {}
            }
        }

        shutdown.cancel();
        watchdog.await.unwrap();
        unsafe {
            std::env::remove_var("NOTIFY_SOCKET");
            std::env::remove_var("WATCHDOG_USEC");
        }
    }
}
