//! WebSocket transport for the relay.

pub mod chat;

pub use chat::chat_ws_handler;
