//! Newline-delimited JSON framing.
//!
//! # Line Format
//!
//! Each message is one compact JSON document followed by `\n`. JSON string
//! escaping guarantees the document itself never contains a raw newline, so
//! the delimiter is unambiguous. Trailing `\r` is tolerated on input.
//!
//! Lines longer than [`MAX_LINE_LENGTH`] are rejected on both sides so a
//! misbehaving peer cannot make the other end buffer without bound.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Maximum length of a single line, delimiter excluded (64 KiB).
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line delimiter.
pub const DELIMITER: u8 = b'\n';

/// Encoder and decoder for newline-delimited JSON messages.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    pub fn new() -> Self {
        Self {
            max_line: MAX_LINE_LENGTH,
        }
    }

    /// Create a codec with a custom line limit.
    pub fn with_max_line(max_line: usize) -> Self {
        Self { max_line }
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }

    /// Encode a message into a delimited line.
    pub fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        let mut bytes =
            serde_json::to_vec(message).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if bytes.len() > self.max_line {
            return Err(ProtocolError::LineTooLong {
                size: bytes.len(),
                max: self.max_line,
            });
        }
        bytes.push(DELIMITER);
        Ok(bytes)
    }

    /// Decode a single line. The delimiter may or may not be present.
    pub fn decode_line<T: DeserializeOwned>(&self, line: &[u8]) -> Result<T> {
        let line = trim_line(line);
        if line.len() > self.max_line {
            return Err(ProtocolError::LineTooLong {
                size: line.len(),
                max: self.max_line,
            });
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return Err(ProtocolError::EmptyLine);
        }
        serde_json::from_slice(line).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Try to decode the first complete line in `data`.
    ///
    /// Returns `Ok(None)` if no delimiter has arrived yet, or the message and
    /// the number of bytes consumed (delimiter included).
    pub fn try_decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<Option<(T, usize)>> {
        match data.iter().position(|b| *b == DELIMITER) {
            Some(end) => {
                let message = self.decode_line(&data[..end])?;
                Ok(Some((message, end + 1)))
            }
            None if data.len() > self.max_line => Err(ProtocolError::LineTooLong {
                size: data.len(),
                max: self.max_line,
            }),
            None => Ok(None),
        }
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == DELIMITER || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}
