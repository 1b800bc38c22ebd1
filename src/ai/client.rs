//! HTTP client for an OpenAI-compatible chat-completions endpoint.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CompletionRequest, CompletionService};
use crate::config::AiConfig;
use crate::{AkatsukiError, Result};

/// Connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// User agent string for completion requests.
const USER_AGENT: &str = "Akatsuki/1.0";

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Groq chat-completions client.
///
/// Without an API key every call returns a simulated answer.
pub struct GroqClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    default_model: String,
}

impl GroqClient {
    /// Create a client from configuration.
    pub fn new(config: &AiConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AkatsukiError::Completion(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            default_model: config.default_model.clone(),
        })
    }

    /// Whether calls go to the real endpoint.
    pub fn is_live(&self) -> bool {
        self.api_key.is_some()
    }

    async fn request(&self, request: CompletionRequest) -> Result<String> {
        let model = request.model.as_deref().unwrap_or(&self.default_model);

        let Some(api_key) = &self.api_key else {
            let preview: String = request.prompt.chars().take(100).collect();
            return Ok(format!(
                "[Simulated AI Response for '{model}'] You asked: '{preview}...'"
            ));
        };

        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        debug!(model = %model, "Requesting completion");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&ChatRequest { model, messages })
            .send()
            .await
            .map_err(|e| AkatsukiError::Completion(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(AkatsukiError::Completion(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| AkatsukiError::Completion(format!("invalid response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AkatsukiError::Completion("response has no choices".to_string()))
    }
}

impl CompletionService for GroqClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        self.request(request).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn fake_endpoint(status_ok: bool) -> String {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| async move {
                if !status_ok {
                    return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})));
                }
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let last = body["messages"]
                    .as_array()
                    .and_then(|m| m.last())
                    .map(|m| m["content"].as_str().unwrap_or_default().to_string())
                    .unwrap_or_default();
                let reply = format!("{auth}|{}|{last}", body["model"].as_str().unwrap_or_default());
                (
                    axum::http::StatusCode::OK,
                    Json(json!({"choices": [{"message": {"role": "assistant", "content": reply}}]})),
                )
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/v1/chat/completions")
    }

    fn config(endpoint: String, api_key: Option<&str>) -> AiConfig {
        AiConfig {
            api_key: api_key.map(str::to_string),
            endpoint,
            timeout_secs: 5,
            ..AiConfig::default()
        }
    }

    #[tokio::test]
    async fn test_simulated_without_key() {
        let client = GroqClient::new(&config("http://127.0.0.1:1".to_string(), None)).unwrap();
        assert!(!client.is_live());

        let text = client
            .complete(CompletionRequest::new("hello there"))
            .await
            .unwrap();
        assert!(text.starts_with("[Simulated AI Response for 'llama3-8b-8192']"));
        assert!(text.contains("hello there"));
    }

    #[tokio::test]
    async fn test_empty_key_is_simulated() {
        let client = GroqClient::new(&config("http://127.0.0.1:1".to_string(), Some(""))).unwrap();
        assert!(!client.is_live());
    }

    #[tokio::test]
    async fn test_live_request() {
        let endpoint = fake_endpoint(true).await;
        let client = GroqClient::new(&config(endpoint, Some("secret"))).unwrap();

        let text = client
            .complete(
                CompletionRequest::new("2+2?")
                    .with_system_prompt("be brief")
                    .with_model(Some("mixtral-8x7b-32768".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(text, "Bearer secret|mixtral-8x7b-32768|2+2?");
    }

    #[tokio::test]
    async fn test_http_error() {
        let endpoint = fake_endpoint(false).await;
        let client = GroqClient::new(&config(endpoint, Some("secret"))).unwrap();

        let err = client
            .complete(CompletionRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, AkatsukiError::Completion(ref m) if m.contains("500")));
    }
}
