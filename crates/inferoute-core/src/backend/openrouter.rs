//! OpenRouter backend
//!
//! One shared HTTP client serves every registered model; each
//! [`OpenRouterBackend`] pins a model id to it. Retrying is left to the
//! router's fallback chain, so a failed call is reported immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::debug;

use super::types::{ChatRequest, ChatResponse, FinishReason, Message};
use super::{Backend, BackendReply, BackendRequest};
use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// OpenRouter API base URL
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Wait assumed when a 429 carries no retry hint
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// OpenRouter chat completions client
#[derive(Clone)]
pub struct OpenRouterClient {
    http_client: HttpClient,
    config: LlmConfig,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.config.timeout_secs)
            .finish()
    }
}

/// Builder for creating an OpenRouterClient
#[derive(Default)]
pub struct OpenRouterClientBuilder {
    config: Option<LlmConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl OpenRouterClientBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the LLM configuration
    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the API key
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the base URL (defaults to the configured one, then OpenRouter)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the HTTP request timeout
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Build the client
    pub fn build(self) -> Result<OpenRouterClient> {
        let config = self.config.unwrap_or_default();
        let api_key = self
            .api_key
            .ok_or_else(|| Error::ConfigError("API key is required".to_string()))?;

        let timeout_secs = self.timeout_secs.unwrap_or(config.timeout_secs);

        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(Error::NetworkError)?;

        let base_url = self
            .base_url
            .or_else(|| Some(config.base_url.clone()).filter(|u| !u.is_empty()))
            .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string());

        Ok(OpenRouterClient {
            http_client,
            config,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl OpenRouterClient {
    /// Create a new builder
    pub fn builder() -> OpenRouterClientBuilder {
        OpenRouterClientBuilder::new()
    }

    /// Base URL requests go to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send one chat completion request for `model`
    pub async fn complete(&self, model: &str, request: &BackendRequest) -> Result<BackendReply> {
        let max_tokens = request
            .max_output_tokens
            .unwrap_or(self.config.max_tokens);
        let chat = ChatRequest::new(model, vec![Message::user(request.prompt.clone())])
            .with_temperature(self.config.temperature)
            .with_max_tokens(max_tokens);

        self.send_request(&chat).await
    }

    async fn send_request(&self, request: &ChatRequest) -> Result<BackendReply> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "Inferoute")
            .json(request)
            .send()
            .await
            .map_err(Error::NetworkError)?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_status(&request.model, status.as_u16(), &body));
        }

        let chat_response: ChatResponse =
            response
                .json()
                .await
                .map_err(|e| Error::BackendCallFailed {
                    backend: request.model.clone(),
                    message: format!("Failed to parse response: {}", e),
                })?;

        reply_from_response(&request.model, chat_response)
    }
}

fn reply_from_response(model: &str, response: ChatResponse) -> Result<BackendReply> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::BackendCallFailed {
            backend: model.to_string(),
            message: "Empty response from API".to_string(),
        })?;

    if choice.finish_reason == Some(FinishReason::Error) {
        return Err(Error::BackendCallFailed {
            backend: model.to_string(),
            message: "Generation finished with an error".to_string(),
        });
    }

    Ok(BackendReply {
        content: choice.message.content,
        model: Some(response.model),
        tokens_used: response.usage.map(|u| u.total_tokens).unwrap_or(0),
        truncated: choice.finish_reason == Some(FinishReason::Length),
    })
}

/// Map a non-success HTTP status onto a backend error
fn map_error_status(model: &str, status: u16, body: &str) -> Error {
    let failed = |message: String| Error::BackendCallFailed {
        backend: model.to_string(),
        message,
    };

    match status {
        401 => failed(
            "Unauthorized: Invalid API key. Set INFEROUTE_API_KEY or OPENROUTER_API_KEY environment variable."
                .to_string(),
        ),
        429 => Error::RateLimited(extract_retry_after(body).unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
        400 => failed(format!("Bad request: {}", body)),
        402 => failed("Payment required: Insufficient credits on OpenRouter account".to_string()),
        403 => failed(format!("Forbidden: {}", body)),
        404 => failed(format!("Model not found or endpoint unavailable: {}", body)),
        500..=599 => failed(format!("Server error ({}): {}", status, body)),
        _ => failed(format!("HTTP error {}: {}", status, body)),
    }
}

/// Extract retry-after value from error response
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}

/// A single OpenRouter model exposed as a backend
#[derive(Debug, Clone)]
pub struct OpenRouterBackend {
    model: String,
    client: Arc<OpenRouterClient>,
}

impl OpenRouterBackend {
    /// Bind a model id to a shared client
    pub fn new(model: impl Into<String>, client: Arc<OpenRouterClient>) -> Self {
        Self {
            model: model.into(),
            client,
        }
    }
}

#[async_trait]
impl Backend for OpenRouterBackend {
    fn id(&self) -> &str {
        &self.model
    }

    async fn call(&self, request: &BackendRequest) -> Result<BackendReply> {
        self.client.complete(&self.model, request).await
    }
}
