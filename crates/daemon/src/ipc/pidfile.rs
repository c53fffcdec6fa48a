//! PID file for single-instance detection.
//!
//! The file lives next to the control socket:
//! `$XDG_RUNTIME_DIR/alistlite/supervisor.pid`, or
//! `/tmp/alistlite-$UID/supervisor.pid` without a runtime dir.
//!
//! Stale files, whose process no longer exists or whose contents do not
//! parse, are removed on read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

pub fn get_pid_file_path() -> PathBuf {
    super::runtime_dir().join("supervisor.pid")
}

/// PID of the running supervisor, if any.
pub fn get_supervisor_pid() -> Option<u32> {
    read_pid(&get_pid_file_path())
}

/// Read a live PID from `path`, removing the file if it is stale.
pub fn read_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    let pid = match contents.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            let _ = fs::remove_file(path);
            return None;
        }
    };

    if is_process_running(pid) {
        Some(pid)
    } else {
        let _ = fs::remove_file(path);
        None
    }
}

fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists. EPERM means it exists
    // but belongs to someone else.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// PID file owned by this process, removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current PID to `path`, creating parent directories.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if it still names us
        if read_pid(&self.path) == Some(std::process::id()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}
