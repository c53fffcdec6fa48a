//! IPC client used by the CLI subcommands.

use std::io;
use std::path::Path;
use std::time::Duration;

use alistlite_protocol::{
    ControlRequest, ControlResponse, LineCodec, ServerAddress, StatusEvent,
};
use tokio::io::BufReader;
use tokio::net::UnixStream;

use super::server::{read_message, write_message, IpcError};

/// Default timeout for quick requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Timeout for requests that may start or stop the engine, unless the
/// caller sets one derived from the engine configuration.
const DEFAULT_LIFECYCLE_TIMEOUT_SECS: u64 = 90;

/// A client for the supervisor's control socket.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    codec: LineCodec,
    timeout: Duration,
    lifecycle_timeout: Duration,
}

impl IpcClient {
    /// Connect to the supervisor at `path`.
    ///
    /// Fails when no supervisor is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;
        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            codec: LineCodec::new(),
            timeout,
            lifecycle_timeout: Duration::from_secs(DEFAULT_LIFECYCLE_TIMEOUT_SECS),
        })
    }

    /// Budget for requests that may start or stop the engine. It should
    /// cover the supervisor's configured startup and shutdown timeouts.
    pub fn with_lifecycle_timeout(mut self, timeout: Duration) -> Self {
        self.lifecycle_timeout = timeout;
        self
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: ControlRequest) -> Result<ControlResponse, IpcError> {
        let timeout = self.timeout;
        self.send_with_timeout(request, timeout).await
    }

    async fn send_with_timeout(
        &mut self,
        request: ControlRequest,
        timeout: Duration,
    ) -> Result<ControlResponse, IpcError> {
        tokio::time::timeout(timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn send_internal(&mut self, request: ControlRequest) -> Result<ControlResponse, IpcError> {
        write_message(&mut self.writer, &self.codec, &request).await?;
        match read_message(&mut self.reader, &self.codec).await? {
            Some(response) => Ok(response),
            None => Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "supervisor closed connection",
            ))),
        }
    }

    fn lifecycle_timeout(&self) -> Duration {
        self.timeout.max(self.lifecycle_timeout)
    }

    /// Returns `true` if the supervisor answers with Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(ControlRequest::Ping).await?;
        Ok(matches!(response, ControlResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<ControlResponse, IpcError> {
        expect(self.send(ControlRequest::Status).await?, |r| {
            matches!(r, ControlResponse::Status { .. })
        })
    }

    /// Start the engine and return its address.
    pub async fn start(&mut self) -> Result<ServerAddress, IpcError> {
        let timeout = self.lifecycle_timeout();
        match self.send_with_timeout(ControlRequest::Start, timeout).await? {
            ControlResponse::Started { address } => Ok(address),
            other => Err(unexpected(other)),
        }
    }

    /// Stop the engine. An explicit `timeout_ms` extends the wait so the
    /// supervisor can use all of it.
    pub async fn stop(&mut self, timeout_ms: Option<u64>) -> Result<(), IpcError> {
        let timeout = match timeout_ms {
            Some(ms) => self
                .lifecycle_timeout()
                .saturating_add(Duration::from_millis(ms)),
            None => self.lifecycle_timeout(),
        };
        let request = ControlRequest::Stop { timeout_ms };
        expect(self.send_with_timeout(request, timeout).await?, |r| {
            matches!(r, ControlResponse::Stopped)
        })
        .map(|_| ())
    }

    /// Toggle the engine. Returns the address if it was started.
    pub async fn toggle(&mut self) -> Result<Option<ServerAddress>, IpcError> {
        let timeout = self.lifecycle_timeout();
        match self.send_with_timeout(ControlRequest::Toggle, timeout).await? {
            ControlResponse::Started { address } => Ok(Some(address)),
            ControlResponse::Stopped => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set_admin_password(&mut self, password: &str) -> Result<(), IpcError> {
        let timeout = self.lifecycle_timeout();
        let request = ControlRequest::SetAdminPassword {
            password: password.to_string(),
        };
        expect(self.send_with_timeout(request, timeout).await?, |r| {
            matches!(r, ControlResponse::PasswordUpdated)
        })
        .map(|_| ())
    }

    pub async fn admin_user(&mut self) -> Result<String, IpcError> {
        let timeout = self.lifecycle_timeout();
        match self.send_with_timeout(ControlRequest::AdminUser, timeout).await? {
            ControlResponse::AdminUser { username } => Ok(username),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the supervisor to stop the engine and exit.
    pub async fn quit(&mut self) -> Result<(), IpcError> {
        expect(self.send(ControlRequest::Quit).await?, |r| {
            matches!(r, ControlResponse::Quitting)
        })
        .map(|_| ())
    }

    /// Turn this connection into a status event stream.
    pub async fn subscribe(mut self) -> Result<EventStream, IpcError> {
        expect(self.send(ControlRequest::Subscribe).await?, |r| {
            matches!(r, ControlResponse::Subscribed)
        })?;
        Ok(EventStream {
            reader: self.reader,
            codec: self.codec,
            _writer: self.writer,
        })
    }
}

/// Status events pushed by the supervisor after a subscribe.
pub struct EventStream {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    codec: LineCodec,
    // Dropping the write half would half-close the socket
    _writer: tokio::io::WriteHalf<UnixStream>,
}

impl EventStream {
    /// Next event, or `None` when the supervisor goes away.
    pub async fn next(&mut self) -> Result<Option<StatusEvent>, IpcError> {
        loop {
            match read_message(&mut self.reader, &self.codec).await? {
                None => return Ok(None),
                Some(ControlResponse::Event(event)) => return Ok(Some(event)),
                Some(ControlResponse::Error { message }) => return Err(IpcError::Remote(message)),
                Some(other) => tracing::debug!("Ignoring non-event message: {:?}", other),
            }
        }
    }
}

fn expect(
    response: ControlResponse,
    ok: impl FnOnce(&ControlResponse) -> bool,
) -> Result<ControlResponse, IpcError> {
    if ok(&response) {
        Ok(response)
    } else {
        Err(unexpected(response))
    }
}

fn unexpected(response: ControlResponse) -> IpcError {
    match response {
        ControlResponse::Error { message } => IpcError::Remote(message),
        other => IpcError::UnexpectedResponse(Box::new(other)),
    }
}

fn timed_out(message: &'static str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message))
}
