//! JSON wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator. Inbound frames
//! are parsed into [`ClientMessage`] at the connection boundary; anything
//! else is a [`ProtocolError`], never a crash.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chat::Role;

/// Inbound `type` tags understood by the relay.
const CLIENT_TYPES: &[&str] = &["auth", "message", "pm", "nick", "color", "command", "ai"];

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Handshake; must be the first frame.
    Auth {
        /// Requested display name.
        #[serde(default)]
        username: String,
        /// Admin shared secret.
        #[serde(default)]
        password: Option<String>,
        /// Request the admin role.
        #[serde(default, rename = "wantAdmin")]
        want_admin: bool,
        /// Initial display color.
        #[serde(default)]
        color: Option<String>,
    },
    /// Public message.
    Message {
        /// Client-chosen message ID.
        #[serde(default)]
        id: Option<String>,
        /// Message text.
        #[serde(default)]
        text: String,
    },
    /// Direct message.
    Pm {
        /// Client-chosen message ID.
        #[serde(default)]
        id: Option<String>,
        /// Recipient names.
        #[serde(default)]
        to: Vec<String>,
        /// Message text.
        #[serde(default)]
        text: String,
    },
    /// Nickname change.
    Nick {
        /// Requested new name.
        #[serde(default, rename = "toNick")]
        to_nick: String,
    },
    /// Display color change.
    Color {
        /// New color; absent or empty clears it.
        #[serde(default)]
        color: Option<String>,
    },
    /// Slash command.
    Command {
        /// Raw command line.
        #[serde(default)]
        raw: String,
    },
    /// Question for the AI, optionally prefixed `--model <alias> `.
    Ai {
        /// Query text.
        #[serde(default)]
        text: String,
    },
}

/// Reasons an inbound frame could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Not valid JSON or missing required fields.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// JSON object without a `type` string.
    #[error("message has no type")]
    MissingType,
    /// `type` not understood by the relay.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

impl ProtocolError {
    /// Short code sent in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnknownType(_) => "unknown_type",
        }
    }
}

impl ClientMessage {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;
        if !CLIENT_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Whether a mute blocks this event.
    pub fn is_message_class(&self) -> bool {
        matches!(
            self,
            ClientMessage::Message { .. } | ClientMessage::Pm { .. } | ClientMessage::Ai { .. }
        )
    }

    /// Tag name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Message { .. } => "message",
            ClientMessage::Pm { .. } => "pm",
            ClientMessage::Nick { .. } => "nick",
            ClientMessage::Color { .. } => "color",
            ClientMessage::Command { .. } => "command",
            ClientMessage::Ai { .. } => "ai",
        }
    }
}

/// Presence entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    /// Display name.
    pub name: String,
    /// Role.
    pub role: Role,
    /// Display color.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    AuthOk {
        /// Admitted name.
        username: String,
        /// Granted role.
        role: Role,
    },
    /// Handshake rejected; the connection closes next.
    AuthFailed {
        /// Human-readable reason.
        reason: String,
    },
    /// Full presence list.
    Users {
        /// Connected users.
        users: Vec<UserInfo>,
    },
    /// Someone joined.
    UserJoin {
        /// The new user.
        user: UserInfo,
    },
    /// Someone left.
    UserLeave {
        /// The departed user.
        user: UserInfo,
    },
    /// System notice.
    System {
        /// Notice text.
        text: String,
    },
    /// Public message.
    Message {
        /// Message ID.
        id: String,
        /// Sender name.
        from: String,
        /// Message text.
        text: String,
        /// RFC 3339 timestamp.
        ts: String,
        /// Sender color.
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
    },
    /// Direct message.
    Pm {
        /// Message ID.
        id: String,
        /// Sender name.
        from: String,
        /// Recipients.
        to: Vec<String>,
        /// Message text.
        text: String,
        /// RFC 3339 timestamp.
        ts: String,
        /// Set on the copy delivered to admins.
        #[serde(skip_serializing_if = "is_false")]
        admin_copy: bool,
    },
    /// Admin broadcast.
    Broadcast {
        /// Admin name.
        from: String,
        /// Broadcast text.
        text: String,
        /// RFC 3339 timestamp.
        ts: String,
    },
    /// Clear local chat history.
    ClearChat,
    /// AI answer.
    AiResp {
        /// Response ID.
        id: String,
        /// Always "AI".
        from: String,
        /// Answer text.
        text: String,
        /// RFC 3339 timestamp.
        ts: String,
    },
    /// Rejected inbound frame.
    Error {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },
}

impl ServerMessage {
    /// Create a system notice.
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    /// Create an error event.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
