//! Control endpoint over a Unix Domain Socket.
//!
//! Stands in for the host's request dispatcher: `Create` reserves a session
//! and returns its token, `Resize` adjusts a live session, `Status` and
//! `ListSessions` report on the daemon.
//!
//! ## Protocol
//!
//! One JSON object per line in each direction. Requests and responses are
//! the [`protocol::ControlRequest`] and [`protocol::ControlResponse`] enums:
//!
//! ```text
//! → {"Create":{"size":{"cols":120,"rows":40}}}
//! ← {"Created":{"token":"q2J...","uri":"ws://127.0.0.1:8001"}}
//! → {"Resize":{"size":{"cols":100,"rows":30},"pid":4821,"token":"q2J..."}}
//! ← "Accepted"
//! ```
//!
//! A resize notification `{cols, rows, processId, token}` travels as
//! `{"size":{"cols":..,"rows":..},"pid":..,"token":".."}`: the dimensions are
//! nested under `size` and the process id is `pid`.

mod client;
mod handler;
mod server;

pub use client::{ControlClient, DaemonStatus};
pub use handler::ControlHandler;
pub use server::{ControlConnection, ControlError, ControlServer};
