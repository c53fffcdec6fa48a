//! Unix Domain Socket control channel between the CLI and the supervisor.
//!
//! ## Overview
//!
//! Messages are [`ControlRequest`]/[`ControlResponse`] values framed as
//! newline-delimited JSON by [`alistlite_protocol::LineCodec`]. A connection
//! carries any number of request/response pairs. After a `Subscribe` request
//! the connection only carries status events until the client hangs up.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/alistlite/supervisor.sock`
//! - Fallback: `/tmp/alistlite-$UID/supervisor.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use alistlite_daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     if client.ping().await? {
//!         println!("Supervisor is running");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! [`ControlRequest`]: alistlite_protocol::ControlRequest
//! [`ControlResponse`]: alistlite_protocol::ControlResponse

mod client;
mod handler;
pub mod pidfile;
mod server;

pub use client::{EventStream, IpcClient};
pub use handler::{serve, ControlHandler};
pub use pidfile::{get_pid_file_path, get_supervisor_pid, PidFile};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Directory name shared by the socket and pid file.
pub(crate) const RUNTIME_DIR_NAME: &str = "alistlite";

/// Path of the supervisor's control socket.
///
/// `$XDG_RUNTIME_DIR` is preferred: it is a per-user tmpfs with 0700
/// permissions that is cleaned up on logout.
pub fn get_socket_path() -> PathBuf {
    runtime_dir().join("supervisor.sock")
}

pub(crate) fn runtime_dir() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir).join(RUNTIME_DIR_NAME),
        _ => PathBuf::from(format!("/tmp/{}-{}", RUNTIME_DIR_NAME, nix::unistd::getuid())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn with_runtime_dir<T>(value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();
        // SAFETY: tests touching the environment are serialized
        unsafe {
            match value {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        let result = f();
        // SAFETY: see above
        unsafe {
            match original {
                Some(v) => std::env::set_var("XDG_RUNTIME_DIR", v),
                None => std::env::remove_var("XDG_RUNTIME_DIR"),
            }
        }
        result
    }

    #[test]
    #[serial]
    fn test_socket_path_with_xdg_runtime_dir() {
        let path = with_runtime_dir(Some("/run/user/1000"), get_socket_path);
        assert_eq!(path, PathBuf::from("/run/user/1000/alistlite/supervisor.sock"));
    }

    #[test]
    #[serial]
    fn test_socket_path_without_xdg_runtime_dir() {
        let path = with_runtime_dir(None, get_socket_path);
        let uid = nix::unistd::getuid();
        assert_eq!(
            path,
            PathBuf::from(format!("/tmp/alistlite-{}/supervisor.sock", uid))
        );
    }

    #[test]
    #[serial]
    fn test_empty_runtime_dir_falls_back() {
        let path = with_runtime_dir(Some(""), get_socket_path);
        assert!(path.starts_with("/tmp"));
        assert!(path.is_absolute());
    }
}
