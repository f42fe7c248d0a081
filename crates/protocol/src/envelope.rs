//! Structured framing for terminal streams.
//!
//! A connection uses one of two framings for its whole life:
//!
//! - [`Framing::Raw`]: every message after the handshake is terminal bytes.
//! - [`Framing::Envelope`]: text messages are JSON envelopes carrying either
//!   input data (`{"data": "..."}`) or a control action
//!   (`{"action": "ping"}`, `{"action": "exit", "event": {"exitCode": 0}}`).
//!   Binary messages are always raw bytes and are never parsed.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Framing used on a streaming transport after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Bytes in both directions, no structure.
    #[default]
    Raw,
    /// JSON envelopes for text messages, raw bytes for binary messages.
    Envelope,
}

/// A structured text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// Terminal input from the client.
    Data {
        /// The input text.
        data: String,
    },
    /// A control action.
    Control(ControlAction),
}

/// Control actions that may appear in an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlAction {
    /// Keep-alive ping.
    Ping,
    /// Reply to a keep-alive ping.
    Pong,
    /// The shell process ended.
    Exit {
        /// How it ended.
        event: ExitEvent,
    },
}

/// Exit notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitEvent {
    /// Process exit code; 0 is a clean exit.
    pub exit_code: u32,
}

impl ExitEvent {
    /// Returns `true` for a clean exit.
    pub fn is_clean(&self) -> bool {
        self.exit_code == 0
    }
}

impl Envelope {
    /// Creates a data envelope.
    pub fn data(data: impl Into<String>) -> Self {
        Envelope::Data { data: data.into() }
    }

    /// Creates an exit notification.
    pub fn exit(exit_code: u32) -> Self {
        Envelope::Control(ControlAction::Exit {
            event: ExitEvent { exit_code },
        })
    }

    /// Parses an envelope from a text message.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the envelope to a text message.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
