//! Chat module for Akatsuki.
//!
//! This module provides the single-room relay:
//! - Session records and per-connection outbound handles
//! - Presence registry with case-insensitive name uniqueness
//! - Broadcast fan-out
//! - Admin slash commands
//! - Connection lifecycle (handshake, dispatch, eviction)

mod broadcast;
mod command;
mod hub;
mod lifecycle;
mod presence;
mod processor;
mod session;

pub use broadcast::Broadcaster;
pub use command::{
    format_help, get_command_help, parse_command, CommandError, CommandInfo, CommandKind,
    ParsedCommand,
};
pub use hub::ChatHub;
pub use lifecycle::{
    normalize_color, AuthError, AuthRequest, ConnectionManager, ConnectionPhase, ConnectionState,
    ManagerSettings, MAX_COLOR_LENGTH,
};
pub use presence::{names_equal, validate_name, NameError, PresenceRegistry, MAX_NAME_LENGTH};
pub use processor::CommandProcessor;
pub use session::{Outbound, Role, Session, SessionHandle, SessionId, POLICY_VIOLATION};
