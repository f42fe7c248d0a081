//! # ptyrelay Protocol Library
//!
//! Wire types shared by the ptyrelay daemon and its clients.
//!
//! ## Overview
//!
//! A terminal session is established in two steps:
//!
//! ```text
//!  client                          daemon
//!    │ ── Create{size} ──────────────▶ │   control endpoint (JSON lines)
//!    │ ◀────────── Created{token,uri}  │
//!    │                                 │
//!    │ ══ WebSocket open ════════════▶ │   streaming transport
//!    │ ── "<token>" ─────────────────▶ │
//!    │ ◀──────────────────── "<pid>"   │   handshake terminator
//!    │ ◀═══════ terminal bytes ══════▶ │
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Control requests and responses, terminal size
//! - [`envelope`]: Optional structured framing for the streaming transport
//! - [`error`]: Error types

pub mod envelope;
pub mod error;
pub mod messages;

pub use envelope::{ControlAction, Envelope, ExitEvent, Framing};
pub use error::{ProtocolError, Result};
pub use messages::{
    decode_pid, encode_pid, ControlRequest, ControlResponse, CreateRequest, CreateResponse,
    ResizeRequest, SessionSummary, TerminalSize, DEFAULT_COLS, DEFAULT_ROWS,
};
