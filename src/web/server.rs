//! Web server for Akatsuki.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::chat::{ChatHub, ConnectionManager};
use crate::config::Config;
use crate::{AkatsukiError, Result};

use super::handlers::AppState;
use super::router::{create_health_router, create_router};

/// HTTP/WebSocket server for the relay.
pub struct WebServer {
    /// Server address.
    addr: SocketAddr,
    /// Application state.
    app_state: Arc<AppState>,
    /// CORS allowed origins.
    cors_origins: Vec<String>,
    /// Moderation sweep interval.
    sweep_interval: Duration,
}

impl WebServer {
    /// Create a new web server.
    pub fn new(config: &Config, manager: Arc<ConnectionManager>) -> Result<Self> {
        let addr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|e| {
                AkatsukiError::Config(format!(
                    "invalid listen address {}:{}: {e}",
                    config.server.host, config.server.port
                ))
            })?;

        Ok(Self {
            addr,
            app_state: Arc::new(AppState::new(manager, &config.server.app_name)),
            cors_origins: config.server.cors_origins.clone(),
            sweep_interval: Duration::from_secs(config.moderation.sweep_interval_secs),
        })
    }

    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the moderation sweep background task.
    ///
    /// Expired bans and mutes are removed every `interval`, independent of
    /// on-demand checks.
    fn start_sweep_task(hub: Arc<ChatHub>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;

                let report = hub.moderation().sweep_expired().await;
                if report.total() > 0 {
                    tracing::info!(
                        bans = report.bans,
                        mutes = report.mutes,
                        "Swept expired moderation records"
                    );
                } else {
                    tracing::debug!("No expired moderation records to sweep");
                }
            }
        })
    }

    fn build_router(&self) -> Router {
        create_router(Arc::clone(&self.app_state), &self.cors_origins).merge(create_health_router())
    }

    /// Run the web server.
    pub async fn run(self) -> std::result::Result<(), std::io::Error> {
        let router = self.build_router();

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        let sweep = Self::start_sweep_task(
            Arc::clone(self.app_state.manager.hub()),
            self.sweep_interval,
        );
        tracing::info!(
            interval_secs = self.sweep_interval.as_secs(),
            "Moderation sweep task started"
        );

        tracing::info!("Web server listening on http://{}", local_addr);

        let result = axum::serve(listener, router).await;
        sweep.abort();
        result
    }

    /// Run the server and return the actual bound address.
    ///
    /// This is useful for testing when binding to port 0.
    pub async fn run_with_addr(self) -> std::result::Result<SocketAddr, std::io::Error> {
        let router = self.build_router();

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        Self::start_sweep_task(
            Arc::clone(self.app_state.manager.hub()),
            self.sweep_interval,
        );

        tracing::info!("Web server listening on http://{}", local_addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("Web server error: {}", e);
            }
        });

        Ok(local_addr)
    }
}
