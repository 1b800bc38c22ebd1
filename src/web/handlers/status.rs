//! Index and status handlers.

use std::sync::Arc;

use axum::{extract::State, response::Html, Json};
use serde::Serialize;

use super::AppState;

/// Relay status.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Application name.
    pub app: String,
    /// Connected users.
    pub users: usize,
    /// Ban records.
    pub bans: usize,
    /// Mute records.
    pub mutes: usize,
}

/// Landing page.
///
/// GET /
pub async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let active = state.manager.hub().registry().len().await;
    Html(format!(
        "<h1>{} Server</h1><p>Active connections: {}</p>",
        escape_html(&state.app_name),
        active
    ))
}

/// Relay status.
///
/// GET /api/status
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let hub = state.manager.hub();
    let (bans, mutes) = hub.moderation().counts().await;
    Json(StatusResponse {
        app: state.app_name.clone(),
        users: hub.registry().len().await,
        bans,
        mutes,
    })
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
