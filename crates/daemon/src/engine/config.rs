//! Access to the engine's `config.json`.
//!
//! The engine owns this file and rewrites it on startup, so the supervisor
//! treats it as opaque JSON: it reads values by dotted path, validates
//! replacements as a JSON object, and derives the public address from the
//! `scheme` section.

use std::fs;
use std::path::{Path, PathBuf};

use alistlite_protocol::{Scheme, ServerAddress};
use serde_json::Value;
use thiserror::Error;

/// File name of the engine configuration inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Port value the engine uses for a disabled listener.
pub const DISABLED_PORT: i64 = -1;

/// Errors reading the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigReadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config is not valid JSON: {0}")]
    Corrupt(String),

    #[error("config key not found: {0}")]
    MissingKey(String),

    #[error("config key {key} has unusable value {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors replacing the engine configuration.
#[derive(Debug, Error)]
pub enum ConfigWriteError {
    #[error("rejected config: {0}")]
    Invalid(String),

    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reader and writer for `{data_dir}/config.json`.
#[derive(Debug, Clone)]
pub struct ConfigAccessor {
    path: PathBuf,
}

impl ConfigAccessor {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(CONFIG_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw text of the configuration file.
    pub fn read_raw(&self) -> Result<String, ConfigReadError> {
        fs::read_to_string(&self.path).map_err(|source| ConfigReadError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Raw text, or a small JSON document describing why it could not be read.
    pub fn read_or_placeholder(&self) -> String {
        match self.read_raw() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Unable to read engine config: {}", e);
                serde_json::json!({
                    "info": "Unable to read config, check storage permissions",
                    "msg": e.to_string(),
                })
                .to_string()
            }
        }
    }

    /// Parsed configuration document.
    pub fn document(&self) -> Result<Value, ConfigReadError> {
        let text = self.read_raw()?;
        serde_json::from_str(&text).map_err(|e| ConfigReadError::Corrupt(e.to_string()))
    }

    /// Look up a value by dotted path, e.g. `scheme.http_port` or `items[0].name`.
    ///
    /// Strings come back unquoted; other values as their JSON text.
    pub fn value(&self, path: &str) -> Result<String, ConfigReadError> {
        let doc = self.document()?;
        let found = lookup(&doc, path)?;
        Ok(match found {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Replace the configuration with `text`.
    ///
    /// `text` must be a JSON object. On any error the existing file is left
    /// untouched.
    pub fn write_raw(&self, text: &str) -> Result<(), ConfigWriteError> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(_)) => {}
            Ok(other) => {
                return Err(ConfigWriteError::Invalid(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
            Err(e) => return Err(ConfigWriteError::Invalid(e.to_string())),
        }

        let io_err = |source| ConfigWriteError::Io {
            path: self.path.clone(),
            source,
        };

        // Write to a temp file first, then rename for atomicity
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, text).map_err(io_err)?;
        if let Err(source) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(io_err(source));
        }

        tracing::info!("Engine config updated at {:?}", self.path);
        Ok(())
    }

    /// Typed view of the `scheme` section.
    pub fn listeners(&self) -> Result<ListenerConfig, ConfigReadError> {
        ListenerConfig::from_document(&self.document()?)
    }

    /// Address clients should use to reach the engine from `ip`.
    pub fn server_address(&self, ip: &str) -> Result<ServerAddress, ConfigReadError> {
        self.listeners()?.public_address(ip)
    }
}

/// Listener settings of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Bind address; empty or unspecified means all interfaces.
    pub address: String,
    pub http_port: i64,
    pub https_port: i64,
    pub force_https: bool,
    /// Unix socket path, relative paths resolve against the data directory.
    pub unix_file: Option<PathBuf>,
}

impl ListenerConfig {
    fn from_document(doc: &Value) -> Result<Self, ConfigReadError> {
        let scheme = doc
            .get("scheme")
            .ok_or_else(|| ConfigReadError::MissingKey("scheme".to_string()))?;

        let port = |key: &str| -> Result<i64, ConfigReadError> {
            match scheme.get(key) {
                None => Ok(DISABLED_PORT),
                Some(v) => as_loose_i64(v).ok_or_else(|| ConfigReadError::InvalidValue {
                    key: format!("scheme.{}", key),
                    value: v.to_string(),
                }),
            }
        };

        let unix_file = scheme
            .get("unix_file")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            address: scheme
                .get("address")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            http_port: port("http_port")?,
            https_port: port("https_port")?,
            force_https: scheme.get("force_https").map(as_loose_bool).unwrap_or(false),
            unix_file,
        })
    }

    /// Scheme advertised to users.
    pub fn public_scheme(&self) -> Scheme {
        if self.force_https && self.https_port != DISABLED_PORT {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    /// TCP port for a web listener, `None` when disabled or out of range.
    pub fn port(&self, scheme: Scheme) -> Option<u16> {
        let raw = match scheme {
            Scheme::Http => self.http_port,
            Scheme::Https => self.https_port,
            Scheme::Unix => return None,
        };
        u16::try_from(raw).ok().filter(|p| *p != 0)
    }

    /// Port of the advertised listener.
    pub fn public_port(&self) -> Option<u16> {
        self.port(self.public_scheme())
    }

    pub fn public_address(&self, ip: &str) -> Result<ServerAddress, ConfigReadError> {
        let scheme = self.public_scheme();
        let port = self.public_port().ok_or_else(|| {
            let key = format!("scheme.{}_port", scheme);
            let value = match scheme {
                Scheme::Https => self.https_port,
                _ => self.http_port,
            };
            ConfigReadError::InvalidValue {
                key,
                value: value.to_string(),
            }
        })?;
        Ok(ServerAddress::new(scheme, ip, port))
    }

    /// Host to dial for local liveness checks.
    pub fn dial_host(&self) -> &str {
        match self.address.as_str() {
            "" | "0.0.0.0" => "127.0.0.1",
            "::" | "[::]" => "::1",
            other => other,
        }
    }
}

/// Convert a dotted path such as `items[0].name` into a JSON pointer.
fn to_pointer(path: &str) -> Option<String> {
    let mut pointer = String::new();
    for part in path.split('.') {
        let (key, indices) = match part.find('[') {
            Some(i) => (&part[..i], Some(&part[i + 1..])),
            None => (part, None),
        };
        if key.is_empty() && indices.is_none() {
            return None;
        }
        if !key.is_empty() {
            pointer.push('/');
            pointer.push_str(&key.replace('~', "~0").replace('/', "~1"));
        }
        if let Some(indices) = indices {
            for index in indices.strip_suffix(']')?.split("][") {
                let index: usize = index.parse().ok()?;
                pointer.push('/');
                pointer.push_str(&index.to_string());
            }
        }
    }
    Some(pointer)
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Result<&'a Value, ConfigReadError> {
    to_pointer(path)
        .and_then(|pointer| doc.pointer(&pointer))
        .ok_or_else(|| ConfigReadError::MissingKey(path.to_string()))
}

fn as_loose_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_loose_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
