//! Persistent boolean flags.
//!
//! Small key-value store for supervisor state that must survive restarts,
//! such as whether first-run bootstrap has completed. It persists to
//! `flags.json` in the supervisor state directory and is only reset by
//! deleting that file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Set once the default admin password and storage mount have been applied.
pub const INITIALIZED_FLAG: &str = "alist_initialized";

/// File name of the flag store inside the state directory.
pub const FLAGS_FILE_NAME: &str = "flags.json";

/// Wrapper for serializing the flag store.
#[derive(Debug, Serialize, Deserialize)]
struct FlagStoreData {
    /// Version of the store format (for future migrations).
    version: u32,
    flags: BTreeMap<String, bool>,
}

impl Default for FlagStoreData {
    fn default() -> Self {
        Self {
            version: 1,
            flags: BTreeMap::new(),
        }
    }
}

/// Thread-safe store of named boolean flags.
pub struct FlagStore {
    path: PathBuf,
    flags: RwLock<BTreeMap<String, bool>>,
}

impl FlagStore {
    /// Creates a store that persists to the given path.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            flags: RwLock::new(BTreeMap::new()),
        }
    }

    /// Creates a store inside `state_dir` and loads it.
    pub fn open<P: AsRef<Path>>(state_dir: P) -> Result<Self> {
        let store = Self::new(state_dir.as_ref().join(FLAGS_FILE_NAME));
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads flags from the JSON file.
    ///
    /// A missing file leaves the store empty.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!("Flag store not found at {:?}, starting empty", self.path);
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read flag store: {}", self.path.display()))?;

        let data: FlagStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse flag store: {}", self.path.display()))?;

        let mut flags = self
            .flags
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on flag store"))?;
        *flags = data.flags;
        Ok(())
    }

    /// Saves flags using a temp file and rename.
    fn save(&self, flags: &BTreeMap<String, bool>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create flag store directory: {}", parent.display())
            })?;
        }

        let data = FlagStoreData {
            version: 1,
            flags: flags.clone(),
        };
        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize flag store")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents).with_context(|| {
            format!("Failed to write temp flag store: {}", temp_path.display())
        })?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp flag store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }

    /// Value of `key`, or `default` when unset.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        let flags = self
            .flags
            .read()
            .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on flag store"))?;
        Ok(flags.get(key).copied().unwrap_or(default))
    }

    /// Set `key` and persist immediately.
    ///
    /// The in-memory value is only changed if the write succeeds.
    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        let mut flags = self
            .flags
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on flag store"))?;

        let mut updated = flags.clone();
        updated.insert(key.to_string(), value);
        self.save(&updated)?;
        *flags = updated;

        tracing::debug!("Flag {} set to {}", key, value);
        Ok(())
    }
}
