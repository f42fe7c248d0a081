//! Control client.
//!
//! Connects to the daemon's control socket and sends one request at a time,
//! waiting for the matching response line.

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{
    ControlRequest, ControlResponse, CreateRequest, CreateResponse, ResizeRequest, SessionSummary,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::server::ControlError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Daemon status as reported over the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStatus {
    /// Issued but unbound tokens.
    pub pending: usize,
    /// Live sessions.
    pub sessions: usize,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
}

/// A client for the daemon's control socket.
pub struct ControlClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl ControlClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, ControlError> {
        Self::connect_with_timeout(path, Duration::from_secs(DEFAULT_TIMEOUT_SECS)).await
    }

    /// Connect to the daemon with a custom timeout for every operation.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, ControlError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| {
                ControlError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connection timed out",
                ))
            })?
            .map_err(ControlError::Io)?;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: ControlRequest) -> Result<ControlResponse, ControlError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| {
                ControlError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation timed out",
                ))
            })?
    }

    async fn send_internal(
        &mut self,
        request: ControlRequest,
    ) -> Result<ControlResponse, ControlError> {
        let mut json = serde_json::to_string(&request).map_err(ControlError::Json)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(ControlError::Io)?;
        self.writer.flush().await.map_err(ControlError::Io)?;

        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(ControlError::Io)?;

        if bytes_read == 0 {
            return Err(ControlError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        let response = serde_json::from_str(line.trim()).map_err(ControlError::Json)?;
        Ok(response)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, ControlError> {
        let response = self.send(ControlRequest::Ping).await?;
        Ok(matches!(response, ControlResponse::Pong))
    }

    /// Reserves a session and returns its token and URI.
    pub async fn create(&mut self, request: CreateRequest) -> Result<CreateResponse, ControlError> {
        match self.send(ControlRequest::Create(request)).await? {
            ControlResponse::Created(created) => Ok(created),
            other => Err(unexpected(other)),
        }
    }

    /// Sends a resize notification.
    pub async fn resize(&mut self, request: ResizeRequest) -> Result<(), ControlError> {
        match self.send(ControlRequest::Resize(request)).await? {
            ControlResponse::Accepted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<DaemonStatus, ControlError> {
        match self.send(ControlRequest::Status).await? {
            ControlResponse::Status {
                pending,
                sessions,
                uptime_secs,
            } => Ok(DaemonStatus {
                pending,
                sessions,
                uptime_secs,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// List all live sessions.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSummary>, ControlError> {
        match self.send(ControlRequest::ListSessions).await? {
            ControlResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: ControlResponse) -> ControlError {
    match response {
        ControlResponse::Error { message } => ControlError::Remote(message),
        other => ControlError::UnexpectedResponse(Box::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::server::ControlServer;
    use protocol::TerminalSize;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_client_connect_fails_when_daemon_not_running() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nonexistent.sock");

        let result = ControlClient::connect(&socket_path).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let server = ControlServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, ControlRequest::Ping);
            conn.send_response(&ControlResponse::Pong).await.unwrap();
        });

        let mut client = ControlClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_create() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let server = ControlServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            match request {
                ControlRequest::Create(create) => {
                    assert_eq!(create.size, Some(TerminalSize::new(120, 40)));
                }
                other => panic!("Expected Create request, got {:?}", other),
            }
            conn.send_response(&ControlResponse::Created(CreateResponse {
                token: "tok".to_string(),
                uri: "ws://127.0.0.1:8001".to_string(),
            }))
            .await
            .unwrap();
        });

        let mut client = ControlClient::connect(&socket_path).await.unwrap();
        let created = client
            .create(CreateRequest {
                size: Some(TerminalSize::new(120, 40)),
                ..CreateRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(created.token, "tok");
        assert_eq!(created.uri, "ws://127.0.0.1:8001");

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_maps_error_response() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let server = ControlServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            conn.read_request().await.unwrap().unwrap();
            conn.send_response(&ControlResponse::Error {
                message: "session capacity exceeded: limit is 1".to_string(),
            })
            .await
            .unwrap();
        });

        let mut client = ControlClient::connect(&socket_path).await.unwrap();
        let result = client.create(CreateRequest::default()).await;
        assert!(matches!(result, Err(ControlError::Remote(ref m)) if m.contains("capacity")));

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_status() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let server = ControlServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.read_request().await.unwrap().unwrap();
            assert_eq!(request, ControlRequest::Status);
            conn.send_response(&ControlResponse::Status {
                pending: 1,
                sessions: 2,
                uptime_secs: 100,
            })
            .await
            .unwrap();
        });

        let mut client = ControlClient::connect(&socket_path).await.unwrap();
        let status = client.status().await.unwrap();
        assert_eq!(
            status,
            DaemonStatus {
                pending: 1,
                sessions: 2,
                uptime_secs: 100
            }
        );

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_unexpected_response() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let server = ControlServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            conn.read_request().await.unwrap().unwrap();
            conn.send_response(&ControlResponse::Pong).await.unwrap();
        });

        let mut client = ControlClient::connect(&socket_path).await.unwrap();
        let result = client.list_sessions().await;
        assert!(matches!(result, Err(ControlError::UnexpectedResponse(_))));

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_timeout() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let server = ControlServer::bind(&socket_path).await.unwrap();

        // Server that never responds
        let _server_handle = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client =
            ControlClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
                .await
                .unwrap();

        let result = client.ping().await;
        assert!(result.is_err());
    }
}
