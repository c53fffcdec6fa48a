//! Host permission inspection.
//!
//! Reports whether the supervisor has what it needs to serve files. The list
//! is rebuilt on every call so it always reflects the current host state.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::Serialize;

use crate::config::Config;
use crate::systemd;

/// One inspected permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionItem {
    /// Stable identifier, e.g. `storage.read`.
    pub name: &'static str,
    /// Label for compact displays.
    pub short_name: &'static str,
    pub description: String,
    pub granted: bool,
}

/// Inspect every permission relevant to `config`.
pub fn inspect(config: &Config) -> Vec<PermissionItem> {
    let storage = &config.bootstrap.storage_path;
    let data_dir = &config.daemon.data_dir;

    vec![
        PermissionItem {
            name: "storage.read",
            short_name: "storage",
            description: format!("Read the default storage directory {}", storage.display()),
            granted: storage_readable(storage),
        },
        PermissionItem {
            name: "data.write",
            short_name: "data",
            description: format!("Write engine data under {}", data_dir.display()),
            granted: dir_writable(data_dir),
        },
        PermissionItem {
            name: "engine.exec",
            short_name: "engine",
            description: format!("Execute the engine binary `{}`", config.engine.binary),
            granted: executable(&config.engine.binary),
        },
        PermissionItem {
            name: "systemd.notify",
            short_name: "systemd",
            description: "Report status and watchdog pings to systemd".to_string(),
            granted: systemd::is_systemd(),
        },
    ]
}

/// Whether `path` is a directory whose entries can be listed.
pub fn storage_readable(path: &Path) -> bool {
    fs::read_dir(path).is_ok()
}

/// Whether files can be created in `path`, creating it if needed.
pub fn dir_writable(path: &Path) -> bool {
    if fs::create_dir_all(path).is_err() {
        return false;
    }
    let marker = path.join(".alistlite-write-check");
    let writable = fs::write(&marker, b"").is_ok();
    let _ = fs::remove_file(&marker);
    writable
}

fn executable(binary: &str) -> bool {
    let path = Path::new(binary);
    if path.components().count() > 1 {
        fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    } else {
        which::which(binary).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_storage_readable() {
        let dir = TempDir::new().unwrap();
        assert!(storage_readable(dir.path()));
        assert!(!storage_readable(&dir.path().join("missing")));

        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(!storage_readable(&file));
    }

    #[test]
    fn test_dir_writable_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        assert!(dir_writable(&nested));
        assert!(nested.is_dir());
        assert_eq!(fs::read_dir(&nested).unwrap().count(), 0);
    }

    #[test]
    fn test_executable() {
        assert!(executable("sh"));
        assert!(!executable("alistlite-no-such-binary"));

        let dir = TempDir::new().unwrap();
        let file = dir.path().join("engine");
        fs::write(&file, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(!executable(file.to_str().unwrap()));
        fs::set_permissions(&file, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(executable(file.to_str().unwrap()));
    }

    #[test]
    fn test_inspect_lists_all_items() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().join("data");
        config.bootstrap.storage_path = dir.path().to_path_buf();
        config.engine.binary = "sh".to_string();

        let items = inspect(&config);
        let names: Vec<_> = items.iter().map(|i| i.name).collect();
        assert_eq!(
            names,
            ["storage.read", "data.write", "engine.exec", "systemd.notify"]
        );
        assert!(items[0].granted);
        assert!(items[1].granted);
        assert!(items[2].granted);
    }
}
