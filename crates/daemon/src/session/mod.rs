//! Session management module.
//!
//! This module provides token issuance, PTY spawning and session lifecycle
//! management. Sessions are reserved with a token, bound when the token is
//! presented on a transport, resized, and torn down.

pub mod manager;
pub mod pty;
pub mod registry;
pub mod shell;
pub mod token;

pub use manager::SessionManager;
pub use pty::{PtyProcess, SessionError, SessionIo, SessionState};
pub use registry::{PendingRequest, SessionRegistry};
pub use shell::ShellInvocation;
pub use token::{generate_token, token_prefix};
