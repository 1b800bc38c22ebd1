//! Configuration module for Akatsuki.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::{AkatsukiError, Result};

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Application name shown to clients.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Seconds a fresh connection has to send its `auth` event.
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    /// CORS allowed origins (empty allows any origin).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_app_name() -> String {
    "Akatsuki".to_string()
}

fn default_auth_timeout() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            app_name: default_app_name(),
            auth_timeout_secs: default_auth_timeout(),
            cors_origins: vec![],
        }
    }
}

/// Admin credentials.
///
/// The admin role is granted to exactly one shared-secret identity.
#[derive(Clone, Deserialize)]
pub struct AdminConfig {
    /// Reserved admin display name.
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Shared secret (must be set, usually via `AKATSUKI_ADMIN_PASSWORD`).
    #[serde(default)]
    pub password: String,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: default_admin_username(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Moderation store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModerationConfig {
    /// Path to the ban/mute snapshot file.
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Interval between expiry sweeps in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Mute duration used when `/mute` is given no duration.
    #[serde(default = "default_mute_minutes")]
    pub default_mute_minutes: u32,
}

fn default_state_file() -> String {
    "server_state.json".to_string()
}

fn default_sweep_interval() -> u64 {
    300 // 5 minutes
}

fn default_mute_minutes() -> u32 {
    5
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            sweep_interval_secs: default_sweep_interval(),
            default_mute_minutes: default_mute_minutes(),
        }
    }
}

/// Chat delivery policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Whether the sender receives its own `message` broadcast.
    #[serde(default = "default_true")]
    pub echo_to_sender: bool,
    /// Whether admins receive a flagged copy of direct messages.
    #[serde(default = "default_true")]
    pub admin_pm_copies: bool,
    /// Maximum characters in a message or direct message.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// Maximum message-class events per window.
    #[serde(default = "default_rate_limit_messages")]
    pub rate_limit_messages: u32,
    /// Rate limit window in seconds.
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    /// Whether new users receive a generated welcome notice.
    #[serde(default = "default_true")]
    pub welcome_message: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_message_length() -> usize {
    2000
}

fn default_rate_limit_messages() -> u32 {
    10
}

fn default_rate_limit_window() -> u64 {
    10
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            echo_to_sender: true,
            admin_pm_copies: true,
            max_message_length: default_max_message_length(),
            rate_limit_messages: default_rate_limit_messages(),
            rate_limit_window_secs: default_rate_limit_window(),
            welcome_message: true,
        }
    }
}

/// External completion service configuration.
#[derive(Clone, Deserialize)]
pub struct AiConfig {
    /// API key; responses are simulated when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Chat-completions endpoint.
    #[serde(default = "default_ai_endpoint")]
    pub endpoint: String,
    /// Model used when no alias is given.
    #[serde(default = "default_ai_model")]
    pub default_model: String,
    /// Total request timeout in seconds.
    #[serde(default = "default_ai_timeout")]
    pub timeout_secs: u64,
    /// Model aliases accepted by `--model <alias>`.
    #[serde(default = "default_ai_models")]
    pub models: BTreeMap<String, String>,
}

fn default_ai_endpoint() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_string()
}

fn default_ai_model() -> String {
    "llama3-8b-8192".to_string()
}

fn default_ai_timeout() -> u64 {
    30
}

fn default_ai_models() -> BTreeMap<String, String> {
    [
        ("llama", "llama3-8b-8192"),
        ("llama70", "llama3-70b-8192"),
        ("mixtral", "mixtral-8x7b-32768"),
        ("gemma", "gemma-7b-it"),
    ]
    .into_iter()
    .map(|(alias, model)| (alias.to_string(), model.to_string()))
    .collect()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_ai_endpoint(),
            default_model: default_ai_model(),
            timeout_secs: default_ai_timeout(),
            models: default_ai_models(),
        }
    }
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("default_model", &self.default_model)
            .field("timeout_secs", &self.timeout_secs)
            .field("models", &self.models)
            .finish()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/akatsuki.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Admin credentials.
    #[serde(default)]
    pub admin: AdminConfig,
    /// Moderation configuration.
    #[serde(default)]
    pub moderation: ModerationConfig,
    /// Chat delivery policy.
    #[serde(default)]
    pub chat: ChatConfig,
    /// Completion service configuration.
    #[serde(default)]
    pub ai: AiConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(AkatsukiError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| AkatsukiError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `AKATSUKI_ADMIN_USERNAME`: reserved admin display name
    /// - `AKATSUKI_ADMIN_PASSWORD`: admin shared secret
    /// - `GROQ_API_KEY`: completion service API key
    pub fn apply_env_overrides(&mut self) {
        if let Some(username) = non_empty_env("AKATSUKI_ADMIN_USERNAME") {
            self.admin.username = username;
        }
        if let Some(password) = non_empty_env("AKATSUKI_ADMIN_PASSWORD") {
            self.admin.password = password;
        }
        if let Some(key) = non_empty_env("GROQ_API_KEY") {
            self.ai.api_key = Some(key);
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.admin.username.trim().is_empty() {
            return Err(AkatsukiError::Validation(
                "admin.username must not be empty".to_string(),
            ));
        }
        if self.admin.password.is_empty() {
            return Err(AkatsukiError::Validation(
                "admin.password is not set. \
                 Set it in config.toml or via AKATSUKI_ADMIN_PASSWORD environment variable."
                    .to_string(),
            ));
        }
        if self.server.auth_timeout_secs == 0 {
            return Err(AkatsukiError::Validation(
                "server.auth_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.moderation.sweep_interval_secs == 0 {
            return Err(AkatsukiError::Validation(
                "moderation.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.chat.rate_limit_window_secs == 0 {
            return Err(AkatsukiError::Validation(
                "chat.rate_limit_window_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
