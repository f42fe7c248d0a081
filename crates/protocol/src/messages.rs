//! Control message definitions for ptyrelay.
//!
//! These are the request/response types exchanged with the handshake
//! dispatcher. They travel as one JSON object per line; the streaming
//! transport itself carries raw terminal bytes (see [`crate::envelope`]).

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Columns used when a request does not specify a size.
pub const DEFAULT_COLS: u16 = 80;

/// Rows used when a request does not specify a size.
pub const DEFAULT_ROWS: u16 = 24;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl TerminalSize {
    /// Creates a new size.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Returns `true` when both dimensions are non-zero.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }

    /// Returns this size, or the 80x24 default when a dimension is zero.
    pub fn or_default(self) -> Self {
        if self.is_valid() {
            self
        } else {
            Self::default()
        }
    }

}

/// Request to reserve a new terminal session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    /// Requested terminal size; 80x24 when absent.
    #[serde(default)]
    pub size: Option<TerminalSize>,
    /// Identity of the requester, used as the SSH user in login-shell mode.
    #[serde(default)]
    pub username: Option<String>,
    /// Extra arguments passed to the local shell.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Response to a [`CreateRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResponse {
    /// Single-use token the client must send as its first transport message.
    pub token: String,
    /// WebSocket URI the client should connect to.
    pub uri: String,
}

/// Terminal resize notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// New terminal size.
    pub size: TerminalSize,
    /// Process ID the client latched from the handshake.
    pub pid: u32,
    /// Token the session was created with.
    pub token: String,
}

/// Requests accepted by the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Reserve a session and obtain a token.
    Create(CreateRequest),
    /// Resize a live session (fire-and-forget).
    Resize(ResizeRequest),
    /// Get pending and live session counts.
    Status,
    /// List live sessions.
    ListSessions,
}

/// Responses sent by the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlResponse {
    /// Response to a Ping request.
    Pong,
    /// A session was reserved.
    Created(CreateResponse),
    /// The request was accepted; no result is reported.
    Accepted,
    /// Current daemon status.
    Status {
        /// Number of tokens issued but not yet bound.
        pending: usize,
        /// Number of live sessions.
        sessions: usize,
        /// Uptime in seconds.
        uptime_secs: u64,
    },
    /// Snapshot of live sessions.
    Sessions {
        /// One entry per live session.
        sessions: Vec<SessionSummary>,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Information about a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Process ID of the shell.
    pub pid: u32,
    /// Current terminal size.
    pub size: TerminalSize,
    /// Identity the session was created for, if any.
    pub username: Option<String>,
    /// Seconds since the session was bound.
    pub age_secs: u64,
}

/// Encodes the handshake terminator sent by the server after a successful bind.
pub fn encode_pid(pid: u32) -> String {
    pid.to_string()
}

/// Parses the handshake terminator on the client side.
pub fn decode_pid(text: &str) -> Result<u32> {
    text.trim()
        .parse::<u32>()
        .map_err(|e| ProtocolError::HandshakeFailed(format!("expected process id, got {text:?}: {e}")))
}
