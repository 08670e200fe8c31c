//! Execution engine
//!
//! Walks a fallback chain until one backend answers. Every attempt gets its
//! own timeout; a timeout counts as a failure. Each outcome is written to
//! the performance ledger. Caller cancellation aborts the in-flight call and
//! nothing is recorded for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventBus, RouterEventKind};
use super::ledger::{Outcome, PerformanceLedger};
use super::types::RequestAnalysis;
use crate::backend::{Backend, BackendReply, BackendRequest};
use crate::error::{Error, Result};

/// Default timeout of a single backend call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Queries above this many tokens expect a substantive answer
const COMPLEX_QUERY_TOKENS: usize = 500;

const HEDGING_PHRASES: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "i'm uncertain",
    "it's unclear",
    "i cannot",
    "i can't determine",
    "i may be wrong",
    "this might not be",
];

/// A successful walk of the chain
#[derive(Debug, Clone)]
pub struct Execution {
    pub backend_id: String,
    pub reply: BackendReply,
    /// Wall-clock time of the successful call
    pub duration_ms: u64,
    /// Chain entries that failed before the serving backend
    pub fallbacks_used: usize,
    pub quality: f64,
}

/// Invokes backends through a fallback chain
#[derive(Debug)]
pub struct ExecutionEngine {
    backends: HashMap<String, Arc<dyn Backend>>,
    ledger: Arc<PerformanceLedger>,
    events: EventBus,
    call_timeout: Duration,
}

impl ExecutionEngine {
    /// Create an engine over a fixed backend table
    pub fn new(
        backends: HashMap<String, Arc<dyn Backend>>,
        ledger: Arc<PerformanceLedger>,
        events: EventBus,
        call_timeout: Duration,
    ) -> Self {
        Self {
            backends,
            ledger,
            events,
            call_timeout,
        }
    }

    /// Per-call timeout
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Whether a backend implementation is bound to `id`
    pub fn has_backend(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    /// Ids of all bound backends, sorted
    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Try each backend in `chain` in order; fails only when all of them fail
    pub async fn execute(
        &self,
        prompt: &str,
        chain: &[String],
        analysis: &RequestAnalysis,
        cancellation: Option<&CancellationToken>,
    ) -> Result<Execution> {
        let request = BackendRequest::new(prompt, analysis.category);
        let mut last_error = String::from("empty fallback chain");

        for (index, backend_id) in chain.iter().enumerate() {
            let Some(backend) = self.backends.get(backend_id) else {
                let err = Error::BackendNotFound(backend_id.clone());
                warn!(backend = %backend_id, "No implementation bound, skipping");
                self.ledger.record(
                    backend_id,
                    Outcome::Failure {
                        latency_ms: 0,
                        error: err.to_string(),
                    },
                );
                last_error = err.to_string();
                continue;
            };

            debug!(backend = %backend_id, attempt = index + 1, "Invoking backend");
            let started = Instant::now();
            let attempt = tokio::time::timeout(self.call_timeout, backend.call(&request));

            let result = match cancellation {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!(backend = %backend_id, "Request cancelled by caller");
                        return Err(Error::Cancelled);
                    }
                    result = attempt => result,
                },
                None => attempt.await,
            };

            let latency_ms = started.elapsed().as_millis() as u64;
            let result = result.unwrap_or_else(|_| {
                Err(Error::BackendTimeout {
                    backend: backend_id.clone(),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            });

            match result {
                Ok(reply) => {
                    let quality = estimate_quality(&reply, analysis.estimated_tokens);
                    self.ledger.record(
                        backend_id,
                        Outcome::Success {
                            latency_ms,
                            quality,
                        },
                    );
                    debug!(
                        backend = %backend_id,
                        duration_ms = latency_ms,
                        fallbacks_used = index,
                        "Backend call succeeded"
                    );
                    return Ok(Execution {
                        backend_id: backend_id.clone(),
                        reply,
                        duration_ms: latency_ms,
                        fallbacks_used: index,
                        quality,
                    });
                }
                Err(err) => {
                    warn!(
                        backend = %backend_id,
                        duration_ms = latency_ms,
                        error = %err,
                        "Backend call failed, falling back"
                    );
                    last_error = err.to_string();
                    self.ledger.record(
                        backend_id,
                        Outcome::Failure {
                            latency_ms,
                            error: last_error.clone(),
                        },
                    );
                }
            }
        }

        warn!(chain = ?chain, last_error = %last_error, "All backends failed");
        self.events.publish(RouterEventKind::ExecutionFailedAll {
            chain: chain.to_vec(),
            last_error: last_error.clone(),
        });

        Err(Error::AllBackendsFailed {
            chain: chain.to_vec(),
            last_error,
        })
    }
}

/// Heuristic quality of a reply in [0, 1].
///
/// Starts at 0.7, gains 0.1 for a substantive answer, loses 0.3 for a very
/// short answer to a long query, 0.15 per hedging phrase and 0.1 when the
/// answer was cut off. Empty answers score 0.
pub fn estimate_quality(reply: &BackendReply, query_tokens: usize) -> f64 {
    if reply.content.trim().is_empty() {
        return 0.0;
    }

    let mut score: f64 = 0.7;
    let words = reply.content.split_whitespace().count();

    if words >= 20 {
        score += 0.1;
    }
    if query_tokens > COMPLEX_QUERY_TOKENS && words < 20 {
        score -= 0.3;
    }

    let lower = reply.content.to_lowercase();
    let hedges = HEDGING_PHRASES
        .iter()
        .filter(|phrase| lower.contains(*phrase))
        .count();
    score -= 0.15 * hedges as f64;

    if reply.truncated {
        score -= 0.1;
    }

    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EchoBackend;
    use crate::routing::analyzer::RequestAnalyzer;
    use crate::routing::types::RouteContext;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Failing(&'static str);

    #[async_trait]
    impl Backend for Failing {
        fn id(&self) -> &str {
            self.0
        }

        async fn call(&self, _request: &BackendRequest) -> Result<BackendReply> {
            Err(Error::BackendCallFailed {
                backend: self.0.to_string(),
                message: "simulated outage".to_string(),
            })
        }
    }

    #[derive(Debug)]
    struct Slow(&'static str, Duration);

    #[async_trait]
    impl Backend for Slow {
        fn id(&self) -> &str {
            self.0
        }

        async fn call(&self, _request: &BackendRequest) -> Result<BackendReply> {
            tokio::time::sleep(self.1).await;
            Ok(BackendReply::text("eventually"))
        }
    }

    fn engine(backends: Vec<Arc<dyn Backend>>) -> (ExecutionEngine, Arc<PerformanceLedger>, EventBus) {
        let ledger = Arc::new(PerformanceLedger::new());
        let events = EventBus::default();
        let table = backends
            .into_iter()
            .map(|b| (b.id().to_string(), b))
            .collect();
        (
            ExecutionEngine::new(table, ledger.clone(), events.clone(), Duration::from_secs(1)),
            ledger,
            events,
        )
    }

    fn chain(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn analysis() -> RequestAnalysis {
        RequestAnalyzer::new().analyze("What is Rust?", &RouteContext::new(), None)
    }

    #[tokio::test]
    async fn test_first_success_stops_chain() {
        let (engine, ledger, _) = engine(vec![
            Arc::new(EchoBackend::new("a")),
            Arc::new(EchoBackend::new("b")),
        ]);

        let execution = engine
            .execute("What is Rust?", &chain(&["a", "b"]), &analysis(), None)
            .await
            .unwrap();
        assert_eq!(execution.backend_id, "a");
        assert_eq!(execution.fallbacks_used, 0);
        assert_eq!(ledger.get("a").unwrap().success_count, 1);
        assert!(ledger.get("b").is_none());
    }

    #[tokio::test]
    async fn test_failure_falls_through() {
        let (engine, ledger, _) = engine(vec![
            Arc::new(Failing("a")),
            Arc::new(EchoBackend::new("b")),
        ]);

        let execution = engine
            .execute("What is Rust?", &chain(&["a", "b"]), &analysis(), None)
            .await
            .unwrap();
        assert_eq!(execution.backend_id, "b");
        assert_eq!(execution.fallbacks_used, 1);

        let a = ledger.get("a").unwrap();
        assert_eq!(a.recent_errors.len(), 1);
        assert!(a.recent_errors[0].message.contains("simulated outage"));
    }

    #[tokio::test]
    async fn test_unbound_backend_counts_as_failure() {
        let (engine, ledger, _) = engine(vec![Arc::new(EchoBackend::new("b"))]);

        let execution = engine
            .execute("What is Rust?", &chain(&["ghost", "b"]), &analysis(), None)
            .await
            .unwrap();
        assert_eq!(execution.fallbacks_used, 1);
        assert_eq!(ledger.get("ghost").unwrap().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_all_failed_reports_chain_and_emits_event() {
        let (engine, _, events) = engine(vec![Arc::new(Failing("a")), Arc::new(Failing("b"))]);
        let mut rx = events.subscribe();

        let err = engine
            .execute("What is Rust?", &chain(&["a", "b"]), &analysis(), None)
            .await
            .unwrap_err();
        match err {
            Error::AllBackendsFailed { chain, last_error } => {
                assert_eq!(chain, vec!["a", "b"]);
                assert!(last_error.contains("'b'"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.kind, RouterEventKind::ExecutionFailedAll { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_triggers_fallback() {
        let (engine, ledger, _) = engine(vec![
            Arc::new(Slow("slow", Duration::from_secs(10))),
            Arc::new(EchoBackend::new("b")),
        ]);

        let execution = engine
            .execute("What is Rust?", &chain(&["slow", "b"]), &analysis(), None)
            .await
            .unwrap();
        assert_eq!(execution.backend_id, "b");

        let slow = ledger.get("slow").unwrap();
        assert_eq!(slow.success_count, 0);
        assert!(slow.recent_errors[0].message.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_skips_recording() {
        let (engine, ledger, _) = engine(vec![Arc::new(Slow("slow", Duration::from_millis(500)))]);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let err = engine
            .execute("What is Rust?", &chain(&["slow"]), &analysis(), Some(&token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(ledger.get("slow").is_none());
    }

    #[test]
    fn test_quality_heuristic() {
        assert_eq!(estimate_quality(&BackendReply::text("   "), 10), 0.0);
        assert!((estimate_quality(&BackendReply::text("Lima."), 10) - 0.7).abs() < 1e-9);

        let hedged = BackendReply::text("I'm not sure, and I may be wrong.");
        assert!((estimate_quality(&hedged, 10) - 0.4).abs() < 1e-9);

        let terse = BackendReply::text("Yes.");
        assert!((estimate_quality(&terse, 1_000) - 0.4).abs() < 1e-9);

        let long = BackendReply::text("word ".repeat(30));
        assert!((estimate_quality(&long, 10) - 0.8).abs() < 1e-9);
    }
}
