//! Shared fixtures for router integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use inferoute_core::backend::{Backend, BackendReply, BackendRequest};
use inferoute_core::config::Config;
use inferoute_core::routing::{CapabilityProfile, Embedder, InferenceRouter};
use inferoute_core::{Error, Result};

/// Backend whose behaviour is set by the test
#[derive(Debug)]
pub struct ScriptedBackend {
    id: String,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl ScriptedBackend {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Duration::ZERO,
        })
    }

    pub fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay,
        })
    }

    pub fn failing(id: &str) -> Arc<Self> {
        let backend = Self::new(id);
        backend.set_failing(true);
        backend
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn call(&self, request: &BackendRequest) -> Result<BackendReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::BackendCallFailed {
                backend: self.id.clone(),
                message: "simulated outage".to_string(),
            });
        }
        Ok(BackendReply::text(format!(
            "{} answered a {} request with a reasonably detailed reply",
            self.id, request.category
        )))
    }
}

/// Embedder with hand-picked vectors so similarities are exact
#[derive(Debug, Default)]
pub struct FixedEmbedder {
    vectors: HashMap<String, Vec<f32>>,
}

impl FixedEmbedder {
    pub fn with(mut self, prompt: &str, vector: [f32; 3]) -> Self {
        self.vectors.insert(prompt.to_string(), vector.to_vec());
        self
    }
}

impl Embedder for FixedEmbedder {
    fn dimensions(&self) -> usize {
        3
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        self.vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0, 0.0, 1.0])
    }
}

/// `fast` is quick and cheap, `smart` is slow and good; `baseline` always answers
pub fn fast_smart_profiles() -> Vec<CapabilityProfile> {
    vec![
        CapabilityProfile::new("fast")
            .with_scores(0.95, 0.1, 0.7)
            .with_max_tokens(16_000)
            .with_avg_response_ms(300),
        CapabilityProfile::new("smart")
            .with_scores(0.4, 0.8, 0.95)
            .with_max_tokens(8_000)
            .with_avg_response_ms(4_000),
    ]
}

pub fn test_config(profiles: Vec<CapabilityProfile>) -> Config {
    let mut config = Config::default();
    config.router.default_backend = "baseline".to_string();
    config.router.baseline_backend = "baseline".to_string();
    config.backends = profiles;
    config
}

pub fn build_router(config: Config, backends: &[Arc<ScriptedBackend>]) -> InferenceRouter {
    InferenceRouter::builder()
        .config(config)
        .backends(backends.iter().map(|b| b.clone() as Arc<dyn Backend>))
        .build()
        .expect("router builds")
}
