//! Inference Router - the request entry point
//!
//! Ties the pipeline together for one router instance:
//! analyze, consult the semantic cache, select a backend, walk the fallback
//! chain, learn from the outcome. All shared state (registry, ledger, cache,
//! preferences) is owned here and handed to the components by `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::analyzer::RequestAnalyzer;
use super::cache::{CacheStats, CachedResponse, SemanticCache};
use super::embedding::{Embedder, HashingEmbedder};
use super::events::{EventBus, RouterEvent, RouterEventKind};
use super::executor::ExecutionEngine;
use super::ledger::{PerformanceLedger, ResponseAttribution};
use super::preferences::{self, PreferenceStore};
use super::registry::CapabilityRegistry;
use super::selector::Selector;
use super::snapshot::{CACHE_SAMPLE_LIMIT, RESPONSE_SAMPLE_LIMIT, RouterSnapshot};
use super::types::{RouteContext, RoutedResponse, ScoringWeights};
use crate::backend::Backend;
use crate::config::Config;
use crate::error::{Error, Result};

/// What became of a feedback submission
#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome {
    /// Attributed to the backend that served the response
    Applied { backend_id: String, satisfaction: f64 },
    /// The response id is not known; nothing changed
    UnknownResponse,
    /// Malformed rating or comment; logged and dropped
    Rejected { reason: String },
}

/// Adaptive inference router
///
/// Cheap to share behind an `Arc`; every method takes `&self` and concurrent
/// `route()` calls proceed independently.
#[derive(Debug)]
pub struct InferenceRouter {
    config: Config,
    analyzer: RequestAnalyzer,
    registry: Arc<CapabilityRegistry>,
    ledger: Arc<PerformanceLedger>,
    cache: Option<Arc<SemanticCache>>,
    preferences: Arc<PreferenceStore>,
    selector: Selector,
    executor: ExecutionEngine,
    events: EventBus,
}

impl InferenceRouter {
    /// Start building a router
    pub fn builder() -> InferenceRouterBuilder {
        InferenceRouterBuilder::new()
    }

    /// Route a prompt to the best backend and return its answer.
    ///
    /// Fails with [`Error::InvalidInput`] for an empty prompt or bad weights,
    /// [`Error::Cancelled`] when the caller's token fires, and
    /// [`Error::AllBackendsFailed`] when no backend in the chain answered.
    pub async fn route(&self, prompt: &str, context: RouteContext) -> Result<RoutedResponse> {
        let started = Instant::now();

        if prompt.trim().is_empty() {
            return Err(Error::InvalidInput("prompt must not be empty".to_string()));
        }
        if let Some(weights) = &context.weights {
            weights.validate()?;
        }

        let user_id = context.user_id.as_deref();
        let preference = user_id.and_then(|user| self.preferences.snapshot(user));
        let analysis = self.analyzer.analyze(prompt, &context, preference);

        if let Some(user) = user_id {
            self.preferences.record_task(user, analysis.category);
        }

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.lookup(prompt, &analysis) {
                let response_id = Uuid::new_v4().to_string();
                let backend_id = hit.entry.response.backend_id.clone();

                self.ledger.record_response(
                    &response_id,
                    ResponseAttribution {
                        backend_id: backend_id.clone(),
                        user_id: context.user_id.clone(),
                        category: analysis.category,
                        cached: true,
                    },
                );
                self.events.publish(RouterEventKind::CacheHit {
                    response_id: response_id.clone(),
                    backend_id: backend_id.clone(),
                    similarity: hit.similarity,
                    category: analysis.category,
                });

                debug!(
                    backend = %backend_id,
                    similarity = hit.similarity,
                    original_response = %hit.entry.response.response_id,
                    "Served from semantic cache"
                );

                return Ok(RoutedResponse {
                    response_id,
                    content: hit.entry.response.content,
                    backend_id,
                    duration_ms: started.elapsed().as_millis() as u64,
                    cached: true,
                    fallbacks_used: 0,
                    analysis,
                });
            }
        }

        let weights: Option<&ScoringWeights> = context.weights.as_ref();
        let selection = self.selector.select(&analysis, weights);
        let chain = self
            .selector
            .build_fallback_chain(&selection.backend_id, &analysis, weights);

        self.events.publish(RouterEventKind::BackendSelected {
            backend_id: selection.backend_id.clone(),
            alternatives: selection.alternatives.clone(),
            reason: selection.reason.clone(),
            chain: chain.clone(),
        });

        let execution = self
            .executor
            .execute(prompt, &chain, &analysis, context.cancellation.as_ref())
            .await?;

        let response_id = Uuid::new_v4().to_string();
        self.ledger.record_response(
            &response_id,
            ResponseAttribution {
                backend_id: execution.backend_id.clone(),
                user_id: context.user_id.clone(),
                category: analysis.category,
                cached: false,
            },
        );

        if let Some(cache) = &self.cache {
            cache.insert(
                prompt,
                CachedResponse {
                    response_id: response_id.clone(),
                    content: execution.reply.content.clone(),
                    backend_id: execution.backend_id.clone(),
                },
                analysis.clone(),
            );
        }

        info!(
            backend = %execution.backend_id,
            category = %analysis.category,
            duration_ms = execution.duration_ms,
            fallbacks_used = execution.fallbacks_used,
            "Request routed"
        );

        Ok(RoutedResponse {
            response_id,
            content: execution.reply.content,
            backend_id: execution.backend_id,
            duration_ms: execution.duration_ms,
            cached: false,
            fallbacks_used: execution.fallbacks_used,
            analysis,
        })
    }

    /// Rate a response from 1 (worst) to 5 (best).
    ///
    /// Never fails: unknown ids and malformed payloads are reported through
    /// the returned [`FeedbackOutcome`] and otherwise ignored.
    pub fn submit_feedback(
        &self,
        response_id: &str,
        rating: f64,
        comment: Option<&str>,
        user_id: Option<&str>,
    ) -> FeedbackOutcome {
        let applied = match self.ledger.apply_feedback(response_id, rating, comment) {
            Ok(Some(applied)) => applied,
            Ok(None) => return FeedbackOutcome::UnknownResponse,
            Err(e) => {
                warn!(response_id = %response_id, error = %e, "Dropping invalid feedback");
                return FeedbackOutcome::Rejected {
                    reason: e.to_string(),
                };
            }
        };

        let user = applied
            .attribution
            .user_id
            .clone()
            .or_else(|| user_id.map(str::to_string));
        if let Some(user) = &user {
            self.preferences.record_feedback(
                user,
                &applied.attribution.backend_id,
                applied.attribution.category,
                applied.satisfaction,
            );
        }

        self.events.publish(RouterEventKind::FeedbackApplied {
            response_id: applied.response_id.clone(),
            backend_id: applied.attribution.backend_id.clone(),
            user_id: user,
            satisfaction: applied.satisfaction,
        });

        FeedbackOutcome::Applied {
            backend_id: applied.attribution.backend_id,
            satisfaction: applied.satisfaction,
        }
    }

    /// Capture registry, ledger, preferences and the newest cache entries
    pub fn export_state(&self) -> RouterSnapshot {
        let mut registry = self.registry.list();
        registry.sort_by(|a, b| a.id.cmp(&b.id));

        RouterSnapshot {
            registry,
            performance: self.ledger.snapshot(),
            preferences: self.preferences.export(),
            cache_sample: self
                .cache
                .as_ref()
                .map(|cache| cache.newest(CACHE_SAMPLE_LIMIT))
                .unwrap_or_default(),
            responses: self.ledger.recent_responses(RESPONSE_SAMPLE_LIMIT),
            ..RouterSnapshot::default()
        }
    }

    /// Replace the learned state with a snapshot.
    ///
    /// An empty registry section keeps the current capability table.
    pub fn import_state(&self, snapshot: RouterSnapshot) -> Result<()> {
        if !snapshot.registry.is_empty() {
            self.registry.replace_all(snapshot.registry)?;
        }
        let backends = snapshot.performance.len();
        let users = snapshot.preferences.len();

        self.ledger.restore(snapshot.performance.into_values());
        self.ledger.restore_responses(snapshot.responses);
        self.preferences.restore(snapshot.preferences.into_values());
        if let Some(cache) = &self.cache {
            cache.restore(snapshot.cache_sample);
        }

        info!(backends, users, "Imported router state");
        Ok(())
    }

    /// Validate and import an untyped JSON snapshot
    pub fn import_state_json(&self, value: serde_json::Value) -> Result<()> {
        self.import_state(RouterSnapshot::from_json(value)?)
    }

    /// Start the periodic preference adaptation pass, if enabled
    pub fn spawn_adaptation(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.adaptation.enabled {
            debug!("Preference adaptation disabled");
            return None;
        }
        let interval = Duration::from_secs(self.config.adaptation.interval_secs.max(1));
        Some(preferences::spawn_adaptation(
            self.preferences.clone(),
            interval,
            cancel,
        ))
    }

    /// Subscribe to router events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    /// Router configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Capability registry
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Performance ledger
    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    /// Semantic cache, absent when caching is disabled
    pub fn cache(&self) -> Option<&Arc<SemanticCache>> {
        self.cache.as_ref()
    }

    /// Cache counters; zeroed when caching is disabled
    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .as_ref()
            .map(|cache| cache.stats())
            .unwrap_or_default()
    }

    /// User preference store
    pub fn preferences(&self) -> &Arc<PreferenceStore> {
        &self.preferences
    }

    /// Backend selector
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Ids with a bound backend implementation
    pub fn bound_backends(&self) -> Vec<String> {
        self.executor.backend_ids()
    }

    /// Event publisher
    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Builder for [`InferenceRouter`]
#[derive(Debug, Default)]
pub struct InferenceRouterBuilder {
    config: Config,
    registry: Option<CapabilityRegistry>,
    backends: HashMap<String, Arc<dyn Backend>>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl InferenceRouterBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the capability registry; defaults to the configured profiles
    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Bind a backend implementation under its own id
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.id().to_string(), backend);
        self
    }

    /// Bind several backend implementations
    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn Backend>>) -> Self {
        for backend in backends {
            self.backends.insert(backend.id().to_string(), backend);
        }
        self
    }

    /// Set the embedder used by the semantic cache
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Build the router
    pub fn build(self) -> Result<InferenceRouter> {
        self.config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let registry = match self.registry {
            Some(registry) => registry,
            None => CapabilityRegistry::from_profiles(self.config.profiles())?,
        };
        let registry = Arc::new(registry);

        let ledger = Arc::new(PerformanceLedger::with_response_log_capacity(
            self.config.router.response_log_capacity,
        ));
        let events = EventBus::new(self.config.router.event_capacity);

        let cache = self.config.cache.enabled.then(|| {
            let embedder = self.embedder.unwrap_or_else(|| {
                Arc::new(HashingEmbedder::new(self.config.cache.embedding_dimensions))
            });
            Arc::new(SemanticCache::new(self.config.cache_config(), embedder))
        });

        let selector = Selector::new(
            self.config.selector_config(),
            registry.clone(),
            ledger.clone(),
        );

        for profile in registry.list() {
            if !self.backends.contains_key(&profile.id) {
                warn!(backend = %profile.id, "Registered backend has no implementation bound");
            }
        }

        let executor = ExecutionEngine::new(
            self.backends,
            ledger.clone(),
            events.clone(),
            Duration::from_millis(self.config.router.call_timeout_ms),
        );

        info!(
            backends = registry.len(),
            cache = cache.is_some(),
            "Inference router ready"
        );

        Ok(InferenceRouter {
            config: self.config,
            analyzer: RequestAnalyzer::new(),
            registry,
            ledger,
            cache,
            preferences: Arc::new(PreferenceStore::new()),
            selector,
            executor,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;
    use crate::routing::types::{CapabilityProfile, TaskCategory};

    fn router() -> InferenceRouter {
        let mut config = Config::default();
        config.router.baseline_backend = "echo/b".to_string();
        config.router.default_backend = "echo/b".to_string();
        config.backends = vec![
            CapabilityProfile::new("echo/a").with_scores(0.9, 0.2, 0.9),
            CapabilityProfile::new("echo/b").with_scores(0.5, 0.5, 0.5),
        ];

        InferenceRouter::builder()
            .config(config)
            .backend(Arc::new(EchoBackend::new("echo/a")))
            .backend(Arc::new(EchoBackend::new("echo/b")))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let router = router();
        let err = router.route("   ", RouteContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_invalid_weights_rejected() {
        let router = router();
        let context = RouteContext::new().with_weights(ScoringWeights::new(-1.0, 0.0, 0.0, 0.0));
        let err = router.route("hello there", context).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_route_then_feedback() {
        let router = router();
        let mut events = router.subscribe();

        let response = router
            .route("What is the capital of Peru", RouteContext::new().with_user("alice"))
            .await
            .unwrap();
        assert_eq!(response.backend_id, "echo/a");
        assert!(!response.cached);
        assert!(matches!(
            events.recv().await.unwrap().kind,
            RouterEventKind::BackendSelected { .. }
        ));

        let outcome = router.submit_feedback(&response.response_id, 5.0, Some("great"), None);
        assert_eq!(
            outcome,
            FeedbackOutcome::Applied {
                backend_id: "echo/a".to_string(),
                satisfaction: 1.0
            }
        );

        let profile = router.preferences().get("alice").unwrap();
        assert_eq!(profile.feedback_count, 1);
        assert!(profile.backend_affinity["echo/a"] > 0.0);
        assert_eq!(router.ledger().get("echo/a").unwrap().feedback_count, 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            RouterEventKind::FeedbackApplied { ref user_id, .. } if user_id.as_deref() == Some("alice")
        ));
    }

    #[tokio::test]
    async fn test_feedback_rejections() {
        let router = router();
        assert_eq!(
            router.submit_feedback("missing", 4.0, None, None),
            FeedbackOutcome::UnknownResponse
        );

        let response = router
            .route("What is the capital of Peru", RouteContext::new())
            .await
            .unwrap();
        assert!(matches!(
            router.submit_feedback(&response.response_id, 9.0, None, None),
            FeedbackOutcome::Rejected { .. }
        ));
        assert_eq!(router.ledger().get("echo/a").unwrap().feedback_count, 0);
    }

    #[tokio::test]
    async fn test_cache_disabled() {
        let mut config = Config::default();
        config.cache.enabled = false;
        let router = InferenceRouter::builder()
            .config(config)
            .backend(Arc::new(EchoBackend::new("openai/gpt-4o-mini")))
            .build()
            .unwrap();

        for _ in 0..2 {
            let response = router.route("hello there", RouteContext::new()).await.unwrap();
            assert!(!response.cached);
        }
        assert!(router.cache().is_none());
        assert_eq!(router.cache_stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn test_export_skips_empty_registry_on_import() {
        let router = router();
        let before = router.registry().len();

        let snapshot = RouterSnapshot::default();
        router.import_state(snapshot).unwrap();
        assert_eq!(router.registry().len(), before);
    }

    #[tokio::test]
    async fn test_task_history_only_for_known_users() {
        let router = router();
        router
            .route("Translate this sentence into French", RouteContext::new().with_user("bob"))
            .await
            .unwrap();
        assert!(router.preferences().get("bob").is_none());

        router
            .preferences()
            .record_feedback("bob", "echo/a", TaskCategory::General, 0.5);
        router
            .route("hello there friend", RouteContext::new().with_user("bob"))
            .await
            .unwrap();
        let profile = router.preferences().get("bob").unwrap();
        assert_eq!(profile.task_history.values().sum::<u64>(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptation_respects_config() {
        let mut config = Config::default();
        config.adaptation.enabled = false;
        let router = InferenceRouter::builder()
            .config(config)
            .build()
            .unwrap();
        assert!(router.spawn_adaptation(CancellationToken::new()).is_none());

        let router = InferenceRouter::builder().build().unwrap();
        let cancel = CancellationToken::new();
        let handle = router.spawn_adaptation(cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_secs(301)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(router.preferences().adaptation_passes(), 1);
    }
}
