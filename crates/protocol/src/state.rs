//! Server state and addressing types shared by the supervisor and its clients.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Listener kinds the engine can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    Unix,
}

impl Scheme {
    /// Every listener kind, in the order they are checked.
    pub const ALL: [Scheme; 3] = [Scheme::Http, Scheme::Https, Scheme::Unix];

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Unix => "unix",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "unix" => Ok(Scheme::Unix),
            other => Err(ProtocolError::UnknownScheme(other.to_string())),
        }
    }
}

/// Lifecycle state of the supervised engine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ServerState {
    /// Engine is not running.
    #[default]
    Stopped,
    /// A start is in flight.
    Starting,
    /// Engine is serving requests.
    Running,
    /// Teardown is in flight.
    Stopping,
    /// The last start attempt failed with the given reason.
    Failed(String),
}

impl ServerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServerState::Running)
    }

    /// Short label suitable for a status line.
    pub fn label(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Externally reachable address of the engine's web listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_parse() {
        assert_eq!("HTTPS".parse::<Scheme>().unwrap(), Scheme::Https);
        assert_eq!("unix".parse::<Scheme>().unwrap(), Scheme::Unix);
        assert!("ftp".parse::<Scheme>().is_err());
    }

    #[test]
    fn test_address_display() {
        let addr = ServerAddress::new(Scheme::Https, "192.168.1.20", 5245);
        assert_eq!(addr.to_string(), "https://192.168.1.20:5245");
    }

    #[test]
    fn test_state_default_is_stopped() {
        assert_eq!(ServerState::default(), ServerState::Stopped);
        assert!(!ServerState::default().is_running());
    }

    #[test]
    fn test_state_serialization_shape() {
        let json = serde_json::to_value(ServerState::Failed("port in use".into())).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "port in use");

        let json = serde_json::to_value(ServerState::Running).unwrap();
        assert_eq!(json["state"], "running");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServerState::Starting.to_string(), "starting");
        assert_eq!(
            ServerState::Failed("boom".into()).to_string(),
            "failed: boom"
        );
    }
}
