//! HTTP and WebSocket surface.
//!
//! Serves the relay's WebSocket endpoint plus a few status routes.

pub mod handlers;
pub mod middleware;
pub mod router;
pub mod server;
pub mod ws;

pub use handlers::AppState;
pub use router::{create_health_router, create_router};
pub use server::WebServer;
