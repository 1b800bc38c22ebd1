//! Akatsuki - a single-room real-time chat relay.
//!
//! Clients connect over WebSocket, authenticate with a display name and
//! exchange public messages, direct messages and admin commands. Bans and
//! mutes survive restarts through an atomically written snapshot file.

pub mod ai;
pub mod chat;
pub mod config;
pub mod datetime;
pub mod error;
pub mod logging;
pub mod moderation;
pub mod protocol;
pub mod rate_limit;
pub mod web;

pub use chat::{
    AuthError, ChatHub, CommandProcessor, ConnectionManager, NameError, PresenceRegistry, Role,
    Session, SessionId,
};
pub use config::Config;
pub use error::{AkatsukiError, Result};
pub use moderation::ModerationStore;
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
