//! Dispatch of control requests to the supervisor.

use std::sync::Arc;
use std::time::Duration;

use alistlite_protocol::{ControlRequest, ControlResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::server::{IpcConnection, IpcError, IpcServer};
use crate::engine::Engine;
use crate::supervisor::{Supervisor, Toggled};

/// Answers control requests on behalf of a supervisor.
pub struct ControlHandler<E: Engine> {
    supervisor: Arc<Supervisor<E>>,
    shutdown: CancellationToken,
}

impl<E: Engine> Clone for ControlHandler<E> {
    fn clone(&self) -> Self {
        Self {
            supervisor: Arc::clone(&self.supervisor),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<E: Engine> ControlHandler<E> {
    /// `shutdown` is cancelled when a client sends `Quit`.
    pub fn new(supervisor: Arc<Supervisor<E>>, shutdown: CancellationToken) -> Self {
        Self {
            supervisor,
            shutdown,
        }
    }

    /// Answer a single request. `Subscribe` and `Quit` need the connection
    /// and are handled in [`ControlHandler::handle_connection`].
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        let supervisor = &self.supervisor;
        match request {
            ControlRequest::Ping => ControlResponse::Pong,
            ControlRequest::Status => ControlResponse::Status {
                state: supervisor.state().await,
                address: supervisor.address().await,
                running: supervisor.is_running().await,
                uptime_secs: supervisor.uptime().await.map_or(0, |d| d.as_secs()),
            },
            ControlRequest::Start => match supervisor.start().await {
                Ok(address) => ControlResponse::Started { address },
                Err(e) => error(e),
            },
            ControlRequest::Stop { timeout_ms } => {
                match timeout_ms {
                    Some(ms) => supervisor.stop(Duration::from_millis(ms)).await,
                    None => supervisor.stop_default().await,
                }
                ControlResponse::Stopped
            }
            ControlRequest::Toggle => match supervisor.toggle().await {
                Ok(Toggled::Started(address)) => ControlResponse::Started { address },
                Ok(Toggled::Stopped) => ControlResponse::Stopped,
                Err(e) => error(e),
            },
            ControlRequest::SetAdminPassword { password } => {
                match supervisor.set_admin_password(&password).await {
                    Ok(()) => ControlResponse::PasswordUpdated,
                    Err(e) => error(e),
                }
            }
            ControlRequest::AdminUser => match supervisor.admin_user().await {
                Ok(username) => ControlResponse::AdminUser { username },
                Err(e) => error(e),
            },
            ControlRequest::Subscribe => ControlResponse::Subscribed,
            ControlRequest::Quit => ControlResponse::Quitting,
        }
    }

    /// Serve one client until it disconnects or subscribes and goes away.
    pub async fn handle_connection(&self, mut conn: IpcConnection) -> Result<(), IpcError> {
        loop {
            let request = match conn.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(IpcError::Protocol(e)) => {
                    conn.send_response(&ControlResponse::Error {
                        message: e.to_string(),
                    })
                    .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!("Control request: {:?}", request);

            match request {
                ControlRequest::Subscribe => return self.stream_events(conn).await,
                ControlRequest::Quit => {
                    info!("Quit requested over the control socket");
                    conn.send_response(&ControlResponse::Quitting).await?;
                    self.shutdown.cancel();
                    return Ok(());
                }
                request => {
                    let response = self.handle(request).await;
                    conn.send_response(&response).await?;
                }
            }
        }
    }

    async fn stream_events(&self, mut conn: IpcConnection) -> Result<(), IpcError> {
        // Subscribe before acknowledging so no event can slip in between
        let mut subscription = self.supervisor.subscribe();
        conn.send_response(&ControlResponse::Subscribed).await?;

        loop {
            tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => conn.send_response(&ControlResponse::Event(event)).await?,
                    None => return Ok(()),
                },
                // Anything the client sends after subscribing is ignored;
                // end of stream means it hung up.
                incoming = conn.read_request() => match incoming {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => return Ok(()),
                },
                _ = self.shutdown.cancelled() => return Ok(()),
            }
        }
    }
}

fn error(e: impl std::fmt::Display) -> ControlResponse {
    ControlResponse::Error {
        message: e.to_string(),
    }
}

/// Accept connections until `shutdown` is cancelled.
pub async fn serve<E: Engine>(server: IpcServer, handler: ControlHandler<E>) {
    let shutdown = handler.shutdown.clone();
    info!("Control socket listening at {:?}", server.path());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => match accepted {
                Ok(conn) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle_connection(conn).await {
                            debug!("Control connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("Control socket closed");
}
