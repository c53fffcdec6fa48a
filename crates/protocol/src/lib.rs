//! # AListLite Protocol Library
//!
//! Shared types for the AListLite supervisor and its control clients.
//!
//! ## Overview
//!
//! - **Status Types**: engine lifecycle state, listener schemes and the
//!   reachable server address
//! - **Control Messages**: requests and responses carried over the local
//!   control socket, plus the status events pushed to subscribers
//! - **Line Codec**: newline-delimited JSON framing with a line length cap
//!
//! ## Example Usage
//!
//! ```rust
//! use alistlite_protocol::{ControlRequest, LineCodec};
//!
//! let codec = LineCodec::new();
//! let line = codec.encode(&ControlRequest::Status).unwrap();
//! let parsed: ControlRequest = codec.decode_line(&line).unwrap();
//! assert_eq!(parsed, ControlRequest::Status);
//! ```
//!
//! ## Modules
//!
//! - [`state`]: Scheme, server state and address
//! - [`messages`]: Control requests, responses and status events
//! - [`framing`]: Line codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;
pub mod state;

pub use error::{ProtocolError, Result};
pub use framing::{LineCodec, DELIMITER, MAX_LINE_LENGTH};
pub use messages::{ControlRequest, ControlResponse, StatusEvent, UpdateInfo};
pub use state::{Scheme, ServerAddress, ServerState};
