//! IPC server side: socket binding and per-connection framing.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use alistlite_protocol::{ControlRequest, ControlResponse, LineCodec, ProtocolError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// Listens for control connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind to `path`, creating parent directories and replacing any stale
    /// socket file. The socket is restricted to the current user.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One client connection.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    codec: LineCodec,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            codec: LineCodec::new(),
        }
    }

    /// Read the next request. Returns `None` once the client disconnects.
    pub async fn read_request(&mut self) -> Result<Option<ControlRequest>, IpcError> {
        read_message(&mut self.reader, &self.codec).await
    }

    pub async fn send_response(&mut self, response: &ControlResponse) -> Result<(), IpcError> {
        write_message(&mut self.writer, &self.codec, response).await
    }
}

/// Read one delimited line, refusing to buffer more than the codec allows.
pub(crate) async fn read_message<R, T>(
    reader: &mut BufReader<R>,
    codec: &LineCodec,
) -> Result<Option<T>, IpcError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut line = Vec::new();
    // Room for the longest allowed line plus "\r\n"
    let limit = codec.max_line() as u64 + 2;
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;

    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && read as u64 == limit {
        let size = line.len() + discard_line(reader).await?;
        return Err(IpcError::Protocol(ProtocolError::LineTooLong {
            size,
            max: codec.max_line(),
        }));
    }

    Ok(Some(codec.decode_line(&line)?))
}

/// Skip the rest of the current line, so the next read starts on a fresh one.
/// Returns the number of bytes dropped.
async fn discard_line<R>(reader: &mut BufReader<R>) -> Result<usize, IpcError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut dropped = 0;
    loop {
        let (consumed, done) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(dropped);
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(consumed);
        dropped += consumed;
        if done {
            return Ok(dropped);
        }
    }
}

pub(crate) async fn write_message<W, T>(
    writer: &mut W,
    codec: &LineCodec,
    message: &T,
) -> Result<(), IpcError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let bytes = codec.encode(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer answered with something other than what the request expects.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Box<ControlResponse>),

    /// The supervisor reported a failure.
    #[error("{0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_server_bind_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_bind_removes_existing_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        std::fs::write(&socket_path, b"stale").unwrap();
        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_accept_and_communicate() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        let client = tokio::spawn(async move {
            let stream = UnixStream::connect(&path).await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(stream);
            let mut reader = BufReader::new(read_half);

            write_half.write_all(b"\"Status\"\n").await.unwrap();
            write_half.flush().await.unwrap();

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            serde_json::from_str::<ControlResponse>(line.trim()).unwrap()
        });

        let mut conn = server.accept().await.unwrap();
        let request = conn.read_request().await.unwrap().unwrap();
        assert_eq!(request, ControlRequest::Status);
        conn.send_response(&ControlResponse::Stopped).await.unwrap();

        assert_eq!(client.await.unwrap(), ControlResponse::Stopped);
    }

    #[tokio::test]
    async fn test_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let path = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&path).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(conn.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_rejects_overlong_line() {
        let (client, server) = UnixStream::pair().unwrap();
        let codec = LineCodec::with_max_line(16);

        tokio::spawn(async move {
            let mut client = client;
            client.write_all(&[b'x'; 64]).await.unwrap();
            client.write_all(b"\n\"Ping\"\n").await.unwrap();
        });

        let mut reader = BufReader::new(server);
        let result: Result<Option<ControlRequest>, _> = read_message(&mut reader, &codec).await;
        assert!(matches!(
            result,
            Err(IpcError::Protocol(ProtocolError::LineTooLong { size: 65, max: 16 }))
        ));

        // The tail of the long line is skipped
        let next: Option<ControlRequest> = read_message(&mut reader, &codec).await.unwrap();
        assert_eq!(next, Some(ControlRequest::Ping));
    }

    #[tokio::test]
    async fn test_read_rejects_garbage() {
        let (client, server) = UnixStream::pair().unwrap();
        tokio::spawn(async move {
            let mut client = client;
            client.write_all(b"{not json\n").await.unwrap();
        });

        let mut reader = BufReader::new(server);
        let result: Result<Option<ControlRequest>, _> =
            read_message(&mut reader, &LineCodec::new()).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }
}
