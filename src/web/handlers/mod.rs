//! HTTP handlers.

mod status;

pub use status::{index, status, StatusResponse};

use std::sync::Arc;

use crate::chat::ConnectionManager;

/// Shared state for all routes.
pub struct AppState {
    /// Connection lifecycle manager.
    pub manager: Arc<ConnectionManager>,
    /// Application name.
    pub app_name: String,
}

impl AppState {
    /// Create application state.
    pub fn new(manager: Arc<ConnectionManager>, app_name: impl Into<String>) -> Self {
        Self {
            manager,
            app_name: app_name.into(),
        }
    }
}
