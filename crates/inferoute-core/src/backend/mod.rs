//! Backend call interface
//!
//! Every language-model backend implements [`Backend`]: one async call
//! taking a prompt and returning a reply. The executor holds a closed table
//! of backend id to implementation and never inspects concrete types.
//!
//! Bundled implementations:
//! - [`OpenRouterBackend`]: OpenAI-compatible chat completions over HTTP
//! - [`EchoBackend`]: local, deterministic, always available

mod echo;
mod openrouter;
mod types;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::routing::TaskCategory;

pub use echo::EchoBackend;
pub use openrouter::{OpenRouterBackend, OpenRouterClient, OpenRouterClientBuilder};
pub use types::{ChatRequest, ChatResponse, Choice, FinishReason, Message, MessageRole, Usage};

/// What a backend is asked to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    pub prompt: String,
    pub category: TaskCategory,
    /// Upper bound on generated tokens, if the caller has one
    pub max_output_tokens: Option<usize>,
}

impl BackendRequest {
    /// Create a request
    pub fn new(prompt: impl Into<String>, category: TaskCategory) -> Self {
        Self {
            prompt: prompt.into(),
            category,
            max_output_tokens: None,
        }
    }
}

/// What a backend answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendReply {
    pub content: String,
    /// Model that actually produced the answer, when the backend reports it
    pub model: Option<String>,
    pub tokens_used: u32,
    /// Generation stopped at the token limit
    pub truncated: bool,
}

impl BackendReply {
    /// Reply with just content
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: None,
            tokens_used: 0,
            truncated: false,
        }
    }
}

/// Uniform call interface implemented by every backend
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Identifier matching the capability profile
    fn id(&self) -> &str;

    /// Serve one request
    async fn call(&self, request: &BackendRequest) -> Result<BackendReply>;
}
