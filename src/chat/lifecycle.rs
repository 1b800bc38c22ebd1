//! Connection lifecycle: handshake, admission, event dispatch, eviction.
//!
//! A connection moves `Connecting -> Authenticating -> Active -> Closed`.
//! The transport task owns the socket; [`ConnectionManager`] owns every
//! decision about what a frame means.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::ChatHub;
use super::presence::{names_equal, validate_name, NameError};
use super::processor::CommandProcessor;
use super::session::{Role, Session, SessionHandle, SessionId};
use crate::ai::{resolve_model_prefix, welcome_prompt, CompletionRequest, CompletionService};
use crate::config::Config;
use crate::datetime::seconds_remaining;
use crate::moderation::is_active;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::rate_limit::{RateLimitConfig, RateLimitResult, SessionRateLimiter};

/// Maximum color length in characters.
pub const MAX_COLOR_LENGTH: usize = 32;

/// Sender name on AI answers.
const AI_SENDER: &str = "AI";

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, nothing read yet.
    Connecting,
    /// Waiting for the `auth` frame.
    Authenticating,
    /// Admitted to the registry.
    Active,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether `next` is a legal successor.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Active)
                | (Authenticating, Closed)
                | (Active, Closed)
        )
    }
}

/// Tracks one connection's state.
#[derive(Debug)]
pub struct ConnectionPhase {
    state: ConnectionState,
    peer: String,
}

impl ConnectionPhase {
    /// Start in `Connecting`.
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Connecting,
            peer: peer.into(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next`. Illegal transitions are refused and logged.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(peer = %self.peer, from = ?self.state, to = ?next, "Illegal connection transition");
            return false;
        }
        debug!(peer = %self.peer, from = ?self.state, to = ?next, "Connection transition");
        self.state = next;
        true
    }
}

/// Why a handshake failed. `Display` is the `auth_failed` reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// First frame was not `auth`.
    #[error("First message must be auth")]
    NotAuth,
    /// First frame could not be parsed.
    #[error("Invalid auth message")]
    Malformed,
    /// Name rejected by the registry.
    #[error("{0}")]
    InvalidName(#[from] NameError),
    /// Name is banned; carries the ban reason.
    #[error("{0}")]
    Banned(String),
    /// Admin requested with wrong credentials.
    #[error("Incorrect admin username or password.")]
    BadAdminCredentials,
    /// No `auth` frame in time.
    #[error("Authentication timed out")]
    Timeout,
    /// Transport closed during the handshake.
    #[error("Connection closed before authentication")]
    Disconnected,
}

/// Parsed `auth` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    /// Requested display name.
    pub username: String,
    /// Admin secret.
    pub password: Option<String>,
    /// Admin role requested.
    pub want_admin: bool,
    /// Initial color.
    pub color: Option<String>,
}

impl AuthRequest {
    /// Request a plain user session.
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }

    /// Request an admin session.
    pub fn admin(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            want_admin: true,
            color: None,
        }
    }

    /// Parse the first frame of a connection.
    pub fn parse_frame(text: &str) -> Result<Self, AuthError> {
        match ClientMessage::parse(text).map_err(|_| AuthError::Malformed)? {
            ClientMessage::Auth {
                username,
                password,
                want_admin,
                color,
            } => Ok(Self {
                username,
                password,
                want_admin,
                color,
            }),
            _ => Err(AuthError::NotAuth),
        }
    }
}

/// Trim a color; empty clears it.
pub fn normalize_color(raw: Option<&str>) -> Result<Option<String>, String> {
    let Some(color) = raw.map(str::trim).filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    if color.chars().count() > MAX_COLOR_LENGTH {
        return Err(format!(
            "Color must be at most {MAX_COLOR_LENGTH} characters."
        ));
    }
    Ok(Some(color.to_string()))
}

/// Policy knobs for the lifecycle manager.
#[derive(Clone)]
pub struct ManagerSettings {
    /// Application name, used in welcome prompts.
    pub app_name: String,
    /// Admin display name.
    pub admin_username: String,
    /// Admin shared secret. Empty disables the admin role.
    pub admin_password: String,
    /// Handshake deadline.
    pub auth_timeout: Duration,
    /// Whether senders receive their own `message`.
    pub echo_to_sender: bool,
    /// Whether admins receive flagged PM copies.
    pub admin_pm_copies: bool,
    /// Message length limit in characters.
    pub max_message_length: usize,
    /// Whether to send a generated welcome notice.
    pub welcome_message: bool,
    /// Message-class rate limit.
    pub rate_limit: RateLimitConfig,
    /// Default `/mute` duration.
    pub default_mute_minutes: u32,
    /// Model aliases for `--model`.
    pub ai_models: BTreeMap<String, String>,
    /// Upper bound on one completion call.
    pub ai_timeout: Duration,
}

impl std::fmt::Debug for ManagerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerSettings")
            .field("app_name", &self.app_name)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"<redacted>")
            .field("auth_timeout", &self.auth_timeout)
            .field("echo_to_sender", &self.echo_to_sender)
            .field("admin_pm_copies", &self.admin_pm_copies)
            .field("max_message_length", &self.max_message_length)
            .field("welcome_message", &self.welcome_message)
            .field("rate_limit", &self.rate_limit)
            .field("default_mute_minutes", &self.default_mute_minutes)
            .field("ai_models", &self.ai_models)
            .field("ai_timeout", &self.ai_timeout)
            .finish()
    }
}

impl ManagerSettings {
    /// Build settings from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_name: config.server.app_name.clone(),
            admin_username: config.admin.username.clone(),
            admin_password: config.admin.password.clone(),
            auth_timeout: Duration::from_secs(config.server.auth_timeout_secs),
            echo_to_sender: config.chat.echo_to_sender,
            admin_pm_copies: config.chat.admin_pm_copies,
            max_message_length: config.chat.max_message_length,
            welcome_message: config.chat.welcome_message,
            rate_limit: RateLimitConfig::new(
                config.chat.rate_limit_messages,
                config.chat.rate_limit_window_secs,
            ),
            default_mute_minutes: config.moderation.default_mute_minutes,
            ai_models: config
                .ai
                .models
                .iter()
                .map(|(alias, model)| (alias.to_lowercase(), model.clone()))
                .collect(),
            ai_timeout: Duration::from_secs(config.ai.timeout_secs),
        }
    }
}

/// Orchestrates every connection's handshake and events.
pub struct ConnectionManager {
    hub: Arc<ChatHub>,
    processor: CommandProcessor,
    completion: Arc<dyn CompletionService>,
    limiter: SessionRateLimiter,
    settings: ManagerSettings,
}

impl ConnectionManager {
    /// Create a manager.
    pub fn new(
        hub: Arc<ChatHub>,
        completion: Arc<dyn CompletionService>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            processor: CommandProcessor::new(Arc::clone(&hub), settings.default_mute_minutes),
            limiter: SessionRateLimiter::new(settings.rate_limit),
            hub,
            completion,
            settings,
        }
    }

    /// Shared hub.
    pub fn hub(&self) -> &Arc<ChatHub> {
        &self.hub
    }

    /// Settings.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn admin_credentials_match(&self, username: &str, password: &str) -> bool {
        if self.settings.admin_password.is_empty() {
            return false;
        }
        let user_ok = self
            .settings
            .admin_username
            .as_bytes()
            .ct_eq(username.as_bytes());
        let pass_ok = self
            .settings
            .admin_password
            .as_bytes()
            .ct_eq(password.as_bytes());
        bool::from(user_ok & pass_ok)
    }

    /// Validate a handshake and admit the session.
    ///
    /// Checks run in order: name shape, ban, admin secret, reserved name,
    /// uniqueness. The first failure ends the attempt.
    pub async fn authenticate(
        &self,
        request: AuthRequest,
        handle: SessionHandle,
    ) -> Result<Session, AuthError> {
        let name = validate_name(&request.username)?;

        // Ban check through `admit` runs under the moderation gate.
        let _gate = self.hub.lock_moderation().await;
        if let Some(reason) = self.hub.moderation().check_ban(&name).await {
            info!(user = %name, "Rejected banned user");
            return Err(AuthError::Banned(reason));
        }

        let role = if request.want_admin {
            let password = request.password.as_deref().unwrap_or_default();
            if !self.admin_credentials_match(&name, password) {
                warn!(user = %name, "Admin authentication failed");
                return Err(AuthError::BadAdminCredentials);
            }
            Role::Admin
        } else {
            if self.hub.registry().is_reserved(&name) {
                return Err(NameError::Reserved.into());
            }
            Role::User
        };

        let color = normalize_color(request.color.as_deref()).unwrap_or(None);
        let mut session = Session::new(name, role, handle).with_color(color);
        session.muted_until = self.hub.moderation().mute_expiry(&session.name).await;

        self.hub.registry().admit(session.clone()).await?;
        Ok(session)
    }

    /// Announce a freshly admitted session.
    pub async fn activate(&self, session: &Session) {
        session.handle.send(ServerMessage::AuthOk {
            username: session.name.clone(),
            role: session.role,
        });

        let broadcaster = self.hub.broadcaster();
        broadcaster
            .broadcast_all(
                &ServerMessage::UserJoin {
                    user: session.user_info(),
                },
                &[session.id],
            )
            .await;
        broadcaster
            .broadcast_all(
                &ServerMessage::system(format!("{} has joined the chat.", session.name)),
                &[session.id],
            )
            .await;

        let users = self.hub.registry().snapshot_list().await;
        session.handle.send(ServerMessage::Users { users });

        info!(session_id = %session.id, user = %session.name, role = %session.role, "User joined");

        if self.settings.welcome_message {
            self.spawn_welcome(session);
        }
    }

    fn spawn_welcome(&self, session: &Session) {
        let completion = Arc::clone(&self.completion);
        let handle = session.handle.clone();
        let request = welcome_prompt(&session.name, &self.settings.app_name);
        let fallback = format!("Welcome to {}, {}!", self.settings.app_name, session.name);
        let timeout = self.settings.ai_timeout;

        tokio::spawn(async move {
            let text = match tokio::time::timeout(timeout, completion.complete(request)).await {
                Ok(Ok(text)) if !text.trim().is_empty() => text,
                Ok(Ok(_)) => fallback,
                Ok(Err(e)) => {
                    debug!(error = %e, "Welcome completion failed");
                    fallback
                }
                Err(_) => {
                    debug!("Welcome completion timed out");
                    fallback
                }
            };
            handle.send(ServerMessage::system(text));
        });
    }

    /// Process one inbound event from an active session.
    pub async fn handle_event(&self, session_id: SessionId, message: ClientMessage) {
        let Some(session) = self.hub.registry().get(session_id).await else {
            return;
        };

        if message.is_message_class() {
            if let Some(reason) = self.mute_reason(&session).await {
                session.handle.send(ServerMessage::system(reason));
                return;
            }
            if let RateLimitResult::Denied { retry_after } =
                self.limiter.check_and_record(session.id)
            {
                session.handle.send(ServerMessage::system(format!(
                    "You are sending messages too fast. Try again in {}s.",
                    retry_after.as_secs().max(1)
                )));
                return;
            }
        }

        match message {
            ClientMessage::Auth { .. } => {
                session
                    .handle
                    .send(ServerMessage::system("Already authenticated."));
            }
            ClientMessage::Message { id, text } => self.public_message(&session, id, text).await,
            ClientMessage::Pm { id, to, text } => self.direct_message(&session, id, to, text).await,
            ClientMessage::Nick { to_nick } => self.change_nick(&session, &to_nick).await,
            ClientMessage::Color { color } => self.change_color(&session, color.as_deref()).await,
            ClientMessage::Command { raw } => {
                self.processor.handle(&session, &raw).await;
            }
            ClientMessage::Ai { text } => self.ask_ai(&session, &text).await,
        }
    }

    /// Mute notice if `session` may not send message-class events.
    async fn mute_reason(&self, session: &Session) -> Option<String> {
        if let Some(until) = session.muted_until {
            let now = self.hub.clock().now();
            if is_active(Some(until), now) {
                return Some(format!(
                    "You are muted for another {}s.",
                    seconds_remaining(until, now)
                ));
            }
            self.hub.registry().set_muted_until(session.id, None).await;
        }
        self.hub.moderation().check_mute(&session.name).await
    }

    fn check_length(&self, session: &Session, text: &str) -> bool {
        if text.chars().count() > self.settings.max_message_length {
            session.handle.send(ServerMessage::system(format!(
                "Message is too long (max {} characters).",
                self.settings.max_message_length
            )));
            return false;
        }
        true
    }

    async fn public_message(&self, session: &Session, id: Option<String>, text: String) {
        if text.trim().is_empty() || !self.check_length(session, &text) {
            return;
        }

        let event = ServerMessage::Message {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            from: session.name.clone(),
            text,
            ts: self.hub.now_iso(),
            color: session.color.clone(),
        };
        let exclude: &[SessionId] = if self.settings.echo_to_sender {
            &[]
        } else {
            std::slice::from_ref(&session.id)
        };
        self.hub.broadcaster().broadcast_all(&event, exclude).await;
    }

    async fn direct_message(
        &self,
        session: &Session,
        id: Option<String>,
        to: Vec<String>,
        text: String,
    ) {
        let mut recipients: Vec<String> = Vec::new();
        for name in to.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            if !recipients.iter().any(|r| names_equal(r, name)) {
                recipients.push(name.to_string());
            }
        }
        if recipients.is_empty() || text.trim().is_empty() {
            session.handle.send(ServerMessage::system(
                "PM requires at least one recipient and a message.",
            ));
            return;
        }
        if !self.check_length(session, &text) {
            return;
        }

        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let ts = self.hub.now_iso();
        let pm = |to: Vec<String>, admin_copy: bool| ServerMessage::Pm {
            id: id.clone(),
            from: session.name.clone(),
            to,
            text: text.clone(),
            ts: ts.clone(),
            admin_copy,
        };

        session.handle.send(pm(recipients.clone(), false));

        let mut involved = vec![session.id];
        for name in &recipients {
            if names_equal(name, &session.name) {
                continue;
            }
            let delivered = self
                .hub
                .broadcaster()
                .send_to_name_with(name, |target| pm(vec![target.name.clone()], false))
                .await;
            match delivered {
                Some(target_id) => involved.push(target_id),
                None => {
                    session.handle.send(ServerMessage::system(format!(
                        "Could not deliver PM to '{name}' (user offline)."
                    )));
                }
            }
        }

        if self.settings.admin_pm_copies && involved.len() > 1 {
            self.hub
                .broadcaster()
                .broadcast_to_role(&pm(recipients, true), Role::Admin, &involved)
                .await;
        }
    }

    async fn change_nick(&self, session: &Session, to_nick: &str) {
        if to_nick.trim().is_empty() {
            return;
        }

        let renamed = {
            let _gate = self.hub.lock_moderation().await;
            if self.hub.moderation().check_ban(to_nick).await.is_some() {
                session
                    .handle
                    .send(ServerMessage::system("That name is banned."));
                return;
            }
            self.hub.registry().rename(session.id, to_nick).await
        };

        match renamed {
            Ok(old) => {
                let new = to_nick.trim();
                info!(session_id = %session.id, from = %old, to = %new, "Nickname changed");
                self.hub
                    .announce(format!("{old} is now known as {new}."))
                    .await;
                self.hub.broadcast_users().await;
            }
            Err(e) => {
                session.handle.send(ServerMessage::system(e.to_string()));
            }
        }
    }

    async fn change_color(&self, session: &Session, color: Option<&str>) {
        match normalize_color(color) {
            Ok(color) => {
                self.hub.registry().set_color(session.id, color).await;
                self.hub.broadcast_users().await;
            }
            Err(reason) => {
                session.handle.send(ServerMessage::system(reason));
            }
        }
    }

    async fn ask_ai(&self, session: &Session, text: &str) {
        let (model, prompt) = match resolve_model_prefix(text, &self.settings.ai_models) {
            Ok(resolved) => resolved,
            Err(alias) => {
                let known: Vec<&str> = self.settings.ai_models.keys().map(String::as_str).collect();
                session.handle.send(ServerMessage::system(format!(
                    "Unknown model '{alias}'. Available models: {}.",
                    known.join(", ")
                )));
                return;
            }
        };
        if prompt.is_empty() {
            session
                .handle
                .send(ServerMessage::system("Usage: ai [--model <alias>] <question>"));
            return;
        }

        self.hub
            .announce(format!("{} is asking the AI...", session.name))
            .await;

        let hub = Arc::clone(&self.hub);
        let completion = Arc::clone(&self.completion);
        let request = CompletionRequest::new(prompt).with_model(model);
        let timeout = self.settings.ai_timeout;

        tokio::spawn(async move {
            let text = match tokio::time::timeout(timeout, completion.complete(request)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => format!("[AI API Error] {e}"),
                Err(_) => "[AI API Error] request timed out".to_string(),
            };
            let event = ServerMessage::AiResp {
                id: Uuid::new_v4().to_string(),
                from: AI_SENDER.to_string(),
                text,
                ts: hub.now_iso(),
            };
            hub.broadcaster().broadcast_all(&event, &[]).await;
        });
    }

    /// Tear down a session. Safe to call more than once.
    pub async fn disconnect(&self, session_id: SessionId) -> Option<Session> {
        self.limiter.remove(session_id);
        self.hub.evict(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::session::Outbound;
    use crate::datetime::{Clock, ManualClock};
    use crate::moderation::ModerationStore;
    use crate::{AkatsukiError, Result};
    use chrono::{TimeZone, Utc};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FixedCompletion(Option<String>);

    impl CompletionService for FixedCompletion {
        fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
            let reply = match &self.0 {
                Some(text) => Ok(format!("{text}:{}", request.model.unwrap_or_default())),
                None => Err(AkatsukiError::Completion("service down".to_string())),
            };
            async move { reply }.boxed()
        }
    }

    struct Fixture {
        manager: ConnectionManager,
        clock: Arc<ManualClock>,
    }

    fn settings() -> ManagerSettings {
        let mut config = Config::default();
        config.admin.password = "s3cret".to_string();
        config.chat.welcome_message = false;
        ManagerSettings::from_config(&config)
    }

    fn fixture_with(settings: ManagerSettings, completion: FixedCompletion) -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let store = Arc::new(ModerationStore::in_memory(Arc::clone(&dyn_clock)));
        let hub = Arc::new(ChatHub::new(
            settings.admin_username.clone(),
            store,
            dyn_clock,
        ));
        Fixture {
            manager: ConnectionManager::new(hub, Arc::new(completion), settings),
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(settings(), FixedCompletion(Some("ok".to_string())))
    }

    async fn connect(
        manager: &ConnectionManager,
        request: AuthRequest,
    ) -> (Session, UnboundedReceiver<Outbound>) {
        let (handle, rx) = SessionHandle::channel();
        let session = manager.authenticate(request, handle).await.unwrap();
        manager.activate(&session).await;
        (session, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        let mut events = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Event(event) = item {
                events.push(event);
            }
        }
        events
    }

    async fn next_event(rx: &mut UnboundedReceiver<Outbound>) -> ServerMessage {
        loop {
            let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            if let Outbound::Event(event) = item {
                return event;
            }
        }
    }

    fn texts(events: &[ServerMessage]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerMessage::System { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn message(text: &str) -> ClientMessage {
        ClientMessage::Message {
            id: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut phase = ConnectionPhase::new("127.0.0.1:1");
        assert!(!phase.transition(ConnectionState::Active));
        assert!(phase.transition(ConnectionState::Authenticating));
        assert!(phase.transition(ConnectionState::Active));
        assert!(phase.transition(ConnectionState::Closed));
        assert!(!phase.transition(ConnectionState::Active));
        assert_eq!(phase.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_parse_auth_frame() {
        assert_eq!(
            AuthRequest::parse_frame(r#"{"type":"auth","username":"alice"}"#),
            Ok(AuthRequest::user("alice"))
        );
        assert_eq!(
            AuthRequest::parse_frame(r#"{"type":"message","text":"hi"}"#),
            Err(AuthError::NotAuth)
        );
        assert_eq!(AuthRequest::parse_frame("{"), Err(AuthError::Malformed));
        assert_eq!(
            AuthError::NotAuth.to_string(),
            "First message must be auth"
        );
    }

    #[test]
    fn test_normalize_color() {
        assert_eq!(normalize_color(None), Ok(None));
        assert_eq!(normalize_color(Some("  ")), Ok(None));
        assert_eq!(normalize_color(Some(" #abc ")), Ok(Some("#abc".to_string())));
        assert!(normalize_color(Some(&"x".repeat(33))).is_err());
    }

    #[tokio::test]
    async fn test_admission_sequence() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        let (_bob, mut bob_rx) = connect(&f.manager, AuthRequest::user("bob")).await;

        let alice_events = drain(&mut alice_rx);
        assert_eq!(
            alice_events[0],
            ServerMessage::AuthOk {
                username: "alice".to_string(),
                role: Role::User
            }
        );
        assert!(matches!(&alice_events[1], ServerMessage::Users { users } if users.len() == 1));
        // Alice joined first, so she sees Bob's join.
        assert!(alice_events
            .iter()
            .any(|e| matches!(e, ServerMessage::UserJoin { user } if user.name == "bob")));
        assert!(texts(&alice_events).contains(&"bob has joined the chat.".to_string()));

        let bob_events = drain(&mut bob_rx);
        assert!(!bob_events
            .iter()
            .any(|e| matches!(e, ServerMessage::UserJoin { .. })));
        assert!(matches!(&bob_events[1], ServerMessage::Users { users } if users.len() == 2));
        assert_eq!(alice.role, Role::User);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_names() {
        let f = fixture();
        let (_alice, _rx) = connect(&f.manager, AuthRequest::user("alice")).await;

        let (handle, _rx2) = SessionHandle::channel();
        assert_eq!(
            f.manager
                .authenticate(AuthRequest::user("ALICE"), handle.clone())
                .await
                .unwrap_err(),
            AuthError::InvalidName(NameError::Taken)
        );
        assert_eq!(
            f.manager
                .authenticate(AuthRequest::user("  "), handle.clone())
                .await
                .unwrap_err()
                .to_string(),
            "Username cannot be empty"
        );
        assert_eq!(
            f.manager
                .authenticate(AuthRequest::user("x".repeat(33)), handle)
                .await
                .unwrap_err(),
            AuthError::InvalidName(NameError::TooLong)
        );
    }

    #[tokio::test]
    async fn test_admin_authentication() {
        let f = fixture();
        let (handle, _rx) = SessionHandle::channel();

        assert_eq!(
            f.manager
                .authenticate(AuthRequest::admin("admin", "wrong"), handle.clone())
                .await
                .unwrap_err(),
            AuthError::BadAdminCredentials
        );
        assert_eq!(
            f.manager
                .authenticate(AuthRequest::user("Admin"), handle.clone())
                .await
                .unwrap_err(),
            AuthError::InvalidName(NameError::Reserved)
        );

        let admin = f
            .manager
            .authenticate(AuthRequest::admin("admin", "s3cret"), handle)
            .await
            .unwrap();
        assert_eq!(admin.role, Role::Admin);
    }

    #[tokio::test]
    async fn test_admin_disabled_without_password() {
        let mut settings = settings();
        settings.admin_password = String::new();
        let f = fixture_with(settings, FixedCompletion(None));
        let (handle, _rx) = SessionHandle::channel();
        assert_eq!(
            f.manager
                .authenticate(AuthRequest::admin("admin", ""), handle)
                .await
                .unwrap_err(),
            AuthError::BadAdminCredentials
        );
    }

    #[tokio::test]
    async fn test_ban_checked_before_credentials() {
        let f = fixture();
        f.manager.hub().moderation().ban("admin", None).await;

        let (handle, _rx) = SessionHandle::channel();
        let err = f
            .manager
            .authenticate(AuthRequest::admin("admin", "wrong"), handle)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Banned("You are banned from this server.".to_string()));
    }

    #[tokio::test]
    async fn test_admission_waits_for_moderation_gate() {
        let f = fixture();
        let hub = f.manager.hub();
        let gate = hub.lock_moderation().await;

        let (handle, _rx) = SessionHandle::channel();
        let admit = f.manager.authenticate(AuthRequest::user("alice"), handle);
        let ban = async {
            hub.moderation().ban("alice", None).await;
            drop(gate);
        };
        let (result, ()) = tokio::join!(admit, ban);

        assert!(matches!(result, Err(AuthError::Banned(_))));
        assert!(hub.registry().find_by_name("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_ban_admits_and_is_removed() {
        let f = fixture();
        f.manager.hub().moderation().ban("carol", Some(10)).await;

        let (handle, _rx) = SessionHandle::channel();
        assert!(matches!(
            f.manager
                .authenticate(AuthRequest::user("carol"), handle.clone())
                .await,
            Err(AuthError::Banned(_))
        ));

        f.clock.advance(chrono::Duration::minutes(10));
        assert!(f
            .manager
            .authenticate(AuthRequest::user("carol"), handle)
            .await
            .is_ok());
        assert_eq!(f.manager.hub().moderation().counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_mute_blocks_until_expiry() {
        let f = fixture();
        let (root, _root_rx) = connect(&f.manager, AuthRequest::admin("admin", "s3cret")).await;
        let (bob, mut bob_rx) = connect(&f.manager, AuthRequest::user("bob")).await;
        let (_carol, mut carol_rx) = connect(&f.manager, AuthRequest::user("carol")).await;

        f.manager
            .handle_event(root.id, ClientMessage::Command { raw: "/mute @bob".to_string() })
            .await;
        drain(&mut bob_rx);
        drain(&mut carol_rx);

        f.manager.handle_event(bob.id, message("hello")).await;
        f.manager
            .handle_event(
                bob.id,
                ClientMessage::Pm {
                    id: None,
                    to: vec!["carol".to_string()],
                    text: "psst".to_string(),
                },
            )
            .await;
        assert_eq!(
            texts(&drain(&mut bob_rx)),
            vec!["You are muted for another 300s.", "You are muted for another 300s."]
        );
        assert!(drain(&mut carol_rx).is_empty());

        // Non-message events are not blocked.
        f.manager
            .handle_event(bob.id, ClientMessage::Color { color: Some("red".to_string()) })
            .await;
        assert!(matches!(drain(&mut carol_rx)[0], ServerMessage::Users { .. }));

        f.clock.advance(chrono::Duration::minutes(5));
        f.manager.handle_event(bob.id, message("hello")).await;
        assert!(matches!(
            &drain(&mut carol_rx)[0],
            ServerMessage::Message { from, text, color, .. }
                if from == "bob" && text == "hello" && color.as_deref() == Some("red")
        ));
        assert!(f.manager.hub().registry().get(bob.id).await.unwrap().muted_until.is_none());
    }

    #[tokio::test]
    async fn test_mute_survives_reconnect() {
        let f = fixture();
        f.manager.hub().moderation().mute("dave", 5).await;

        let (dave, mut dave_rx) = connect(&f.manager, AuthRequest::user("dave")).await;
        assert!(dave.muted_until.is_some());
        drain(&mut dave_rx);

        f.manager.handle_event(dave.id, message("hi")).await;
        assert_eq!(texts(&drain(&mut dave_rx)), vec!["You are muted for another 300s."]);
    }

    #[tokio::test]
    async fn test_echo_policy() {
        let mut settings = settings();
        settings.echo_to_sender = false;
        let f = fixture_with(settings, FixedCompletion(None));
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        let (_bob, mut bob_rx) = connect(&f.manager, AuthRequest::user("bob")).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        f.manager.handle_event(alice.id, message("hi bob")).await;
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx).len(), 1);

        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        drain(&mut alice_rx);
        f.manager.handle_event(alice.id, message("echo")).await;
        assert!(matches!(drain(&mut alice_rx)[0], ServerMessage::Message { .. }));
    }

    #[tokio::test]
    async fn test_empty_and_long_messages() {
        let mut settings = settings();
        settings.max_message_length = 5;
        let f = fixture_with(settings, FixedCompletion(None));
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        drain(&mut alice_rx);

        f.manager.handle_event(alice.id, message("   ")).await;
        assert!(drain(&mut alice_rx).is_empty());

        f.manager.handle_event(alice.id, message("too long")).await;
        assert_eq!(
            texts(&drain(&mut alice_rx)),
            vec!["Message is too long (max 5 characters)."]
        );
    }

    #[tokio::test]
    async fn test_direct_message_delivery() {
        let f = fixture();
        let (root, mut root_rx) = connect(&f.manager, AuthRequest::admin("admin", "s3cret")).await;
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        let (_bob, mut bob_rx) = connect(&f.manager, AuthRequest::user("bob")).await;
        drain(&mut root_rx);
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        f.manager
            .handle_event(
                alice.id,
                ClientMessage::Pm {
                    id: Some("m1".to_string()),
                    to: vec!["Bob".to_string(), "ghost".to_string()],
                    text: "hi".to_string(),
                },
            )
            .await;

        let alice_events = drain(&mut alice_rx);
        assert!(matches!(
            &alice_events[0],
            ServerMessage::Pm { to, admin_copy: false, .. } if to == &vec!["Bob".to_string(), "ghost".to_string()]
        ));
        assert_eq!(
            texts(&alice_events),
            vec!["Could not deliver PM to 'ghost' (user offline)."]
        );

        let bob_events = drain(&mut bob_rx);
        assert_eq!(bob_events.len(), 1);
        assert!(matches!(
            &bob_events[0],
            ServerMessage::Pm { id, from, to, admin_copy: false, .. }
                if id == "m1" && from == "alice" && to == &vec!["bob".to_string()]
        ));

        let root_events = drain(&mut root_rx);
        assert_eq!(root_events.len(), 1);
        assert!(matches!(&root_events[0], ServerMessage::Pm { admin_copy: true, .. }));
        assert!(root.is_admin());
    }

    #[tokio::test]
    async fn test_direct_message_requires_recipient_and_text() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        drain(&mut alice_rx);

        f.manager
            .handle_event(
                alice.id,
                ClientMessage::Pm {
                    id: None,
                    to: vec![],
                    text: "hi".to_string(),
                },
            )
            .await;
        assert_eq!(
            texts(&drain(&mut alice_rx)),
            vec!["PM requires at least one recipient and a message."]
        );
    }

    #[tokio::test]
    async fn test_nick_change() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        let (_bob, _bob_rx) = connect(&f.manager, AuthRequest::user("bob")).await;
        drain(&mut alice_rx);

        f.manager
            .handle_event(alice.id, ClientMessage::Nick { to_nick: "BOB".to_string() })
            .await;
        assert_eq!(texts(&drain(&mut alice_rx)), vec!["Username is already in use"]);

        f.manager
            .handle_event(alice.id, ClientMessage::Nick { to_nick: " alicia ".to_string() })
            .await;
        let events = drain(&mut alice_rx);
        assert_eq!(texts(&events), vec!["alice is now known as alicia."]);
        assert!(matches!(
            events.last(),
            Some(ServerMessage::Users { users }) if users.iter().any(|u| u.name == "alicia")
        ));
    }

    #[tokio::test]
    async fn test_nick_to_banned_name_rejected() {
        let f = fixture();
        f.manager.hub().moderation().ban("troll", None).await;
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        drain(&mut alice_rx);

        f.manager
            .handle_event(alice.id, ClientMessage::Nick { to_nick: "Troll".to_string() })
            .await;
        assert_eq!(texts(&drain(&mut alice_rx)), vec!["That name is banned."]);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let mut settings = settings();
        settings.rate_limit = RateLimitConfig::new(2, 60);
        let f = fixture_with(settings, FixedCompletion(None));
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        drain(&mut alice_rx);

        for _ in 0..3 {
            f.manager.handle_event(alice.id, message("spam")).await;
        }
        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 3);
        assert!(texts(&events)[0].starts_with("You are sending messages too fast."));
    }

    #[tokio::test]
    async fn test_ai_query() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        drain(&mut alice_rx);

        f.manager
            .handle_event(alice.id, ClientMessage::Ai { text: "--model mixtral why?".to_string() })
            .await;
        assert_eq!(
            next_event(&mut alice_rx).await,
            ServerMessage::system("alice is asking the AI...")
        );
        match next_event(&mut alice_rx).await {
            ServerMessage::AiResp { from, text, .. } => {
                assert_eq!(from, "AI");
                assert_eq!(text, "ok:mixtral-8x7b-32768");
            }
            other => panic!("Expected ai_resp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ai_failure_and_unknown_model() {
        let f = fixture_with(settings(), FixedCompletion(None));
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        drain(&mut alice_rx);

        f.manager
            .handle_event(alice.id, ClientMessage::Ai { text: "--model gpt9 hi".to_string() })
            .await;
        let notice = texts(&drain(&mut alice_rx));
        assert!(notice[0].starts_with("Unknown model 'gpt9'."));
        assert!(notice[0].contains("mixtral"));

        f.manager
            .handle_event(alice.id, ClientMessage::Ai { text: "hi".to_string() })
            .await;
        next_event(&mut alice_rx).await;
        match next_event(&mut alice_rx).await {
            ServerMessage::AiResp { text, .. } => {
                assert_eq!(text, "[AI API Error] completion error: service down");
            }
            other => panic!("Expected ai_resp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_welcome_message_and_fallback() {
        let mut settings = settings();
        settings.welcome_message = true;
        let f = fixture_with(settings.clone(), FixedCompletion(Some("hey".to_string())));
        let (_alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        next_event(&mut alice_rx).await; // auth_ok
        next_event(&mut alice_rx).await; // users
        assert_eq!(next_event(&mut alice_rx).await, ServerMessage::system("hey:"));

        let f = fixture_with(settings, FixedCompletion(None));
        let (_alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        next_event(&mut alice_rx).await;
        next_event(&mut alice_rx).await;
        assert_eq!(
            next_event(&mut alice_rx).await,
            ServerMessage::system("Welcome to Akatsuki, alice!")
        );
    }

    #[tokio::test]
    async fn test_repeated_auth_and_disconnect() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.manager, AuthRequest::user("alice")).await;
        let (_bob, mut bob_rx) = connect(&f.manager, AuthRequest::user("bob")).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        f.manager
            .handle_event(
                alice.id,
                ClientMessage::Auth {
                    username: "x".to_string(),
                    password: None,
                    want_admin: false,
                    color: None,
                },
            )
            .await;
        assert_eq!(texts(&drain(&mut alice_rx)), vec!["Already authenticated."]);

        assert!(f.manager.disconnect(alice.id).await.is_some());
        assert!(f.manager.disconnect(alice.id).await.is_none());
        let leaves = drain(&mut bob_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerMessage::UserLeave { .. }))
            .count();
        assert_eq!(leaves, 1);

        // Events from an evicted session are ignored.
        f.manager.handle_event(alice.id, message("ghost")).await;
        assert!(drain(&mut bob_rx).is_empty());
    }
}
