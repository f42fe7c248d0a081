//! Control server over a Unix Domain Socket.
//!
//! The server accepts connections from the host's request dispatcher (or the
//! CLI) and answers one JSON line per request.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::{ControlRequest, ControlResponse};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::handler::ControlHandler;

/// Longest request line accepted, excluding the newline.
const MAX_REQUEST_LINE: u64 = 64 * 1024;

/// A server that listens for control connections on a Unix Domain Socket.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the server to the specified socket path.
    ///
    /// Creates missing parent directories and replaces a stale socket file
    /// left behind by a previous run.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<ControlConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(ControlConnection::new(stream))
    }

    /// Accepts connections and answers their requests until `shutdown` fires.
    ///
    /// The socket file is removed on return.
    pub async fn serve(self, handler: Arc<ControlHandler>, shutdown: CancellationToken) {
        tracing::info!(path = %self.path.display(), "Control server listening");

        loop {
            let conn = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept control connection");
                        continue;
                    }
                },
            };

            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = serve_connection(conn, &handler) => {}
                }
            });
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!(error = %e, "Failed to remove control socket");
        }
        tracing::info!("Control server stopped");
    }
}

async fn serve_connection(mut conn: ControlConnection, handler: &ControlHandler) {
    loop {
        let response = match conn.read_request().await {
            Ok(Some(request)) => handler.handle(request),
            Ok(None) => break,
            Err(ControlError::Json(e)) => ControlResponse::Error {
                message: format!("invalid request: {}", e),
            },
            Err(e @ ControlError::RequestTooLarge(_)) => {
                tracing::warn!(error = %e, "Dropping control connection");
                // The rest of the line is unread, so the stream cannot resync
                let response = ControlResponse::Error {
                    message: e.to_string(),
                };
                let _ = conn.send_response(&response).await;
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Control connection failed");
                break;
            }
        };

        if let Err(e) = conn.send_response(&response).await {
            tracing::debug!(error = %e, "Failed to send control response");
            break;
        }
    }
}

/// A connection to a control client.
///
/// Wraps a Unix stream and exchanges newline-delimited JSON.
pub struct ControlConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl ControlConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected. A line longer than
    /// 64 KiB is rejected without buffering the remainder.
    pub async fn read_request(&mut self) -> Result<Option<ControlRequest>, ControlError> {
        let mut line = String::new();
        let bytes_read = (&mut self.reader)
            .take(MAX_REQUEST_LINE + 1)
            .read_line(&mut line)
            .await
            .map_err(ControlError::Io)?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if bytes_read as u64 > MAX_REQUEST_LINE && !line.ends_with('\n') {
            return Err(ControlError::RequestTooLarge(MAX_REQUEST_LINE));
        }

        let request = serde_json::from_str(line.trim()).map_err(ControlError::Json)?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &ControlResponse) -> Result<(), ControlError> {
        let mut json = serde_json::to_string(response).map_err(ControlError::Json)?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(ControlError::Io)?;
        self.writer.flush().await.map_err(ControlError::Io)?;

        Ok(())
    }
}

/// Errors that can occur during control communication.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A request line exceeded the size limit.
    #[error("request too large: limit is {0} bytes")]
    RequestTooLarge(u64),

    /// The daemon answered with an error.
    #[error("daemon error: {0}")]
    Remote(String),

    /// The daemon answered with a response that does not fit the request.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(Box<ControlResponse>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::SessionManager;
    use std::time::Duration;
    use tempfile::tempdir;

    fn handler() -> Arc<ControlHandler> {
        let mut config = Config::default();
        config.shell.default_shell = "/bin/sh".to_string();
        Arc::new(ControlHandler::new(Arc::new(SessionManager::new(&config))))
    }

    async fn roundtrip_line(socket_path: &Path, line: &str) -> ControlResponse {
        let stream = UnixStream::connect(socket_path).await.unwrap();
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        write_half.write_all(line.as_bytes()).await.unwrap();
        write_half.flush().await.unwrap();

        let mut response_line = String::new();
        reader.read_line(&mut response_line).await.unwrap();
        serde_json::from_str(response_line.trim()).unwrap()
    }

    #[tokio::test]
    async fn test_server_bind_creates_parent_dirs() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("dir").join("control.sock");

        let _server = ControlServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_server_bind_removes_existing_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let first = ControlServer::bind(&socket_path).await.unwrap();
        drop(first);

        let _second = ControlServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_connection_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");

        let server = ControlServer::bind(&socket_path).await.unwrap();

        let socket_path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _stream = UnixStream::connect(&socket_path_clone).await.unwrap();
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = conn.read_request().await.unwrap();
        assert!(request.is_none());
    }

    #[tokio::test]
    async fn test_serve_answers_ping() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");
        let server = ControlServer::bind(&socket_path).await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(handler(), shutdown.clone()));

        let request = serde_json::to_string(&ControlRequest::Ping).unwrap();
        let response = roundtrip_line(&socket_path, &format!("{}\n", request)).await;
        assert_eq!(response, ControlResponse::Pong);

        shutdown.cancel();
        task.await.unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_serve_reports_malformed_request() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");
        let server = ControlServer::bind(&socket_path).await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(handler(), shutdown.clone()));

        let response = roundtrip_line(&socket_path, "{not json}\n").await;
        match response {
            ControlResponse::Error { message } => assert!(message.contains("invalid request")),
            other => panic!("Expected Error response, got {:?}", other),
        }

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_rejects_oversized_line() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("control.sock");
        let server = ControlServer::bind(&socket_path).await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.serve(handler(), shutdown.clone()));

        let line = "x".repeat(70 * 1024);
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            roundtrip_line(&socket_path, &line),
        )
        .await
        .unwrap();
        match response {
            ControlResponse::Error { message } => assert!(message.contains("too large")),
            other => panic!("Expected Error response, got {:?}", other),
        }

        // The listener keeps serving other clients
        let request = serde_json::to_string(&ControlRequest::Ping).unwrap();
        let response = roundtrip_line(&socket_path, &format!("{}\n", request)).await;
        assert_eq!(response, ControlResponse::Pong);

        shutdown.cancel();
        task.await.unwrap();
    }
}
