//! Test helpers for E2E tests.
//!
//! Provides TestServer (a relay on an ephemeral port) and TestClient (a
//! WebSocket client speaking the JSON protocol).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use akatsuki::ai::GroqClient;
use akatsuki::chat::{ChatHub, ConnectionManager, ManagerSettings};
use akatsuki::config::Config;
use akatsuki::datetime::{Clock, SystemClock};
use akatsuki::moderation::ModerationStore;
use akatsuki::web::WebServer;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Admin password used by test servers.
pub const ADMIN_PASSWORD: &str = "test-admin-secret";

/// Create a test configuration bound to an ephemeral port.
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.admin.password = ADMIN_PASSWORD.to_string();
    config.chat.welcome_message = false;
    config
}

/// A running relay.
pub struct TestServer {
    /// Bound address.
    pub addr: SocketAddr,
    /// Shared hub, for inspecting state.
    pub hub: Arc<ChatHub>,
}

impl TestServer {
    /// Start a relay with the default test configuration.
    pub async fn new() -> Self {
        Self::with_config(create_test_config(), None).await
    }

    /// Start a relay with `config`, persisting moderation to `state_file`.
    pub async fn with_config(config: Config, state_file: Option<&Path>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = match state_file {
            Some(path) => ModerationStore::load(path, Arc::clone(&clock)).await,
            None => ModerationStore::in_memory(Arc::clone(&clock)),
        };
        let hub = Arc::new(ChatHub::new(&config.admin.username, Arc::new(store), clock));
        let completion = Arc::new(GroqClient::new(&config.ai).expect("completion client"));
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&hub),
            completion,
            ManagerSettings::from_config(&config),
        ));

        let addr = WebServer::new(&config, manager)
            .expect("web server")
            .run_with_addr()
            .await
            .expect("bind");

        Self { addr, hub }
    }

    /// WebSocket URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

/// WebSocket test client.
pub struct TestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Open a connection without authenticating.
    pub async fn connect(server: &TestServer) -> Self {
        let (stream, _) = connect_async(server.ws_url()).await.expect("connect");
        Self { stream }
    }

    /// Connect and authenticate as a user, returning the client after `auth_ok`.
    pub async fn login(server: &TestServer, username: &str) -> Self {
        let mut client = Self::connect(server).await;
        client
            .send_json(json!({"type": "auth", "username": username}))
            .await;
        client.expect_type("auth_ok").await;
        client.expect_type("users").await;
        client
    }

    /// Connect and authenticate as the admin.
    pub async fn login_admin(server: &TestServer) -> Self {
        let mut client = Self::connect(server).await;
        client
            .send_json(json!({
                "type": "auth",
                "username": "admin",
                "password": ADMIN_PASSWORD,
                "wantAdmin": true
            }))
            .await;
        let ok = client.expect_type("auth_ok").await;
        assert_eq!(ok["role"], "admin");
        client.expect_type("users").await;
        client
    }

    /// Send a JSON frame.
    pub async fn send_json(&mut self, value: Value) {
        self.send_text(&value.to_string()).await;
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .expect("send");
    }

    /// Send a public message.
    pub async fn say(&mut self, text: &str) {
        self.send_json(json!({"type": "message", "text": text})).await;
    }

    /// Send an admin command.
    pub async fn command(&mut self, raw: &str) {
        self.send_json(json!({"type": "command", "raw": raw})).await;
    }

    /// Next JSON event, or `None` when the connection closed.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            let frame = timeout(DEFAULT_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for frame")?;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid JSON"))
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Skip events until one of `kind` arrives.
    pub async fn expect_type(&mut self, kind: &str) -> Value {
        loop {
            let event = self
                .next_json()
                .await
                .unwrap_or_else(|| panic!("connection closed while waiting for {kind}"));
            if event["type"] == kind {
                return event;
            }
        }
    }

    /// Skip events until a `system` notice containing `needle` arrives.
    pub async fn expect_system(&mut self, needle: &str) -> String {
        loop {
            let event = self.expect_type("system").await;
            let text = event["text"].as_str().unwrap_or_default().to_string();
            if text.contains(needle) {
                return text;
            }
        }
    }

    /// Read until the server closes, returning the close code.
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            let frame = timeout(DEFAULT_TIMEOUT, self.stream.next())
                .await
                .expect("timed out waiting for close");
            match frame {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    /// Assert nothing arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(Ok(Message::Text(text)))) = timeout(window, self.stream.next()).await {
            panic!("unexpected event: {text}");
        }
    }

    /// Close the connection.
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Policy-violation close code as seen by the client.
pub fn policy_violation() -> u16 {
    u16::from(CloseCode::Policy)
}
