//! External chat-completion collaborator.
//!
//! The relay only sees the narrow [`CompletionService`] interface; the
//! HTTP client behind it is [`GroqClient`].

mod client;

pub use client::GroqClient;

use std::collections::BTreeMap;

use futures::future::BoxFuture;

use crate::Result;

/// One completion call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// User prompt.
    pub prompt: String,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// Model ID; `None` uses the client's default.
    pub model: Option<String>,
}

impl CompletionRequest {
    /// Create a request for `prompt` with the default model.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
        }
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the model ID.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// Something that answers prompts.
pub trait CompletionService: Send + Sync {
    /// Produce a completion. Transport errors surface as `Err`.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>>;
}

/// Split an optional `--model <alias> ` prefix off an AI query.
///
/// Returns the resolved model ID (if a prefix was given) and the remaining
/// prompt, or the unknown alias.
pub fn resolve_model_prefix<'a>(
    text: &'a str,
    models: &BTreeMap<String, String>,
) -> std::result::Result<(Option<String>, &'a str), String> {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("--model") else {
        return Ok((None, trimmed));
    };
    if !rest.starts_with(char::is_whitespace) {
        return Ok((None, trimmed));
    }

    let rest = rest.trim_start();
    let (alias, prompt) = match rest.find(char::is_whitespace) {
        Some(pos) => (&rest[..pos], rest[pos..].trim_start()),
        None => (rest, ""),
    };

    match models.get(&alias.to_lowercase()) {
        Some(model) => Ok((Some(model.clone()), prompt)),
        None => Err(alias.to_string()),
    }
}

/// The welcome prompt sent after a user joins.
pub fn welcome_prompt(username: &str, app_name: &str) -> CompletionRequest {
    CompletionRequest::new(format!(
        "Generate a short, cool, and welcoming message for a user named '{username}' \
         who just joined the '{app_name}' chat server. Keep it under 20 words."
    ))
    .with_system_prompt(format!(
        "You are the friendly host of the {app_name} chat server."
    ))
}
