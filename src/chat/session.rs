//! Session records and the per-connection outbound handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{ServerMessage, UserInfo};

/// Opaque session identifier, generated at admission and never reused.
pub type SessionId = Uuid;

/// WebSocket close code used for kicks and bans.
pub const POLICY_VIOLATION: u16 = 1008;

/// Role of a session, fixed at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular participant.
    User,
    /// Passed the shared-secret check.
    Admin,
}

impl Role {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Item queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Deliver an event.
    Event(ServerMessage),
    /// Close the connection with the given code.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Send/close capability for one connection.
///
/// Items are queued in submission order and drained by the connection task,
/// so a slow socket never blocks the sender.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    /// Create a handle and the receiver its connection task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Returns false if the connection is gone.
    pub fn send(&self, event: ServerMessage) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    /// Ask the connection to close. Returns false if it is already gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    /// Whether the connection task has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One authenticated live connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session ID.
    pub id: SessionId,
    /// Display name (1-32 characters, unique case-insensitively).
    pub name: String,
    /// Role granted at admission.
    pub role: Role,
    /// Optional display color.
    pub color: Option<String>,
    /// End of the current mute, if any. Not persisted.
    pub muted_until: Option<DateTime<Utc>>,
    /// Outbound handle.
    pub handle: SessionHandle,
}

impl Session {
    /// Create a session with a fresh ID.
    pub fn new(name: impl Into<String>, role: Role, handle: SessionHandle) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            role,
            color: None,
            muted_until: None,
            handle,
        }
    }

    /// Set the display color.
    pub fn with_color(mut self, color: Option<String>) -> Self {
        self.color = color;
        self
    }

    /// Check if the session holds the admin role.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Public presence entry for this session.
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            name: self.name.clone(),
            role: self.role,
            color: self.color.clone(),
        }
    }
}
