//! Offline echo backend

use async_trait::async_trait;

use super::{Backend, BackendReply, BackendRequest};
use crate::error::Result;
use crate::routing::estimate_tokens;

/// Longest prompt excerpt repeated back
const EXCERPT_CHARS: usize = 280;

/// Answers locally by echoing the prompt; never fails
#[derive(Debug, Clone)]
pub struct EchoBackend {
    id: String,
}

impl EchoBackend {
    /// Create an echo backend answering under `id`
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Backend for EchoBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, request: &BackendRequest) -> Result<BackendReply> {
        let excerpt: String = request.prompt.chars().take(EXCERPT_CHARS).collect();
        let truncated = request.prompt.chars().count() > EXCERPT_CHARS;
        let content = format!(
            "[{} | {}] You asked: {}{}",
            self.id,
            request.category,
            excerpt.trim(),
            if truncated { "..." } else { "" }
        );

        Ok(BackendReply {
            tokens_used: (estimate_tokens(&request.prompt) + estimate_tokens(&content)) as u32,
            content,
            model: Some(self.id.clone()),
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::TaskCategory;

    #[tokio::test]
    async fn test_echo_is_deterministic() {
        let backend = EchoBackend::new("local/echo");
        let request = BackendRequest::new("What is Rust?", TaskCategory::General);

        let a = backend.call(&request).await.unwrap();
        let b = backend.call(&request).await.unwrap();
        assert_eq!(a, b);
        assert!(a.content.contains("What is Rust?"));
        assert!(a.content.contains("local/echo"));
        assert!(!a.truncated);
    }

    #[tokio::test]
    async fn test_long_prompt_is_excerpted() {
        let backend = EchoBackend::new("local/echo");
        let request = BackendRequest::new("x".repeat(1_000), TaskCategory::General);

        let reply = backend.call(&request).await.unwrap();
        assert!(reply.truncated);
        assert!(reply.content.ends_with("..."));
        assert!(reply.content.len() < 400);
    }
}
