//! # ptyrelay Daemon Library
//!
//! Relays interactive shells to browser terminal emulators.
//!
//! ## Overview
//!
//! The daemon spawns a real shell (or an outbound SSH session) attached to a
//! pseudo-terminal for every bound WebSocket and pumps bytes both ways until
//! either side goes away. It provides:
//!
//! - **Session Registry**: pending requests and live sessions behind one lock
//! - **Session Manager**: token issue, PTY spawn, resize, teardown
//! - **Transport Relay**: token handshake, framing, heartbeat, disconnect handling
//! - **Control Socket**: JSON-lines endpoint for `Create`, `Resize` and status
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Relay Server                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────────┐        ┌───────────────────────────────┐  │
//! │  │  Control Server  │───────▶│        Session Manager        │  │
//! │  │  (Unix socket)   │        │  ┌─────────────────────────┐  │  │
//! │  └──────────────────┘        │  │    Session Registry     │  │  │
//! │                              │  └─────────────────────────┘  │  │
//! │  ┌──────────────────┐        └───────────────┬───────────────┘  │
//! │  │ WebSocket accept │──▶ Relay ◀─── PTY ─────┘                  │
//! │  └──────────────────┘                                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ptyrelay::{Config, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut server = RelayServer::new(config);
//!     server.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Registry, PTY processes and the session manager
//! - [`relay`]: One WebSocket bound to one session
//! - [`control`]: Control socket server and client
//! - [`server`]: Listener lifecycle and shutdown

pub mod config;
pub mod control;
pub mod relay;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};

pub use session::{
    PendingRequest, PtyProcess, SessionError, SessionIo, SessionManager, SessionRegistry,
    SessionState, ShellInvocation,
};

pub use relay::{handle_connection, CloseReason, RelayOptions};

pub use control::{ControlClient, ControlError, ControlHandler, ControlServer, DaemonStatus};

pub use server::{RelayServer, ServerEvent, ServerState};
