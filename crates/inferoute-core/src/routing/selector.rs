//! Backend selection
//!
//! Scores every eligible backend for a request and builds the ordered
//! fallback chain the executor walks.
//!
//! ## Eligibility
//!
//! A backend is eligible when it declares the request's category (any
//! backend serves `general`) and the request's token estimate fits its
//! token budget.
//!
//! ## Scoring
//!
//! Weighted sum of four sub-scores, each in [0, 1]:
//!
//! - **speed**: mean of the profile speed and `1 / (1 + latency_s)`, using
//!   observed latency when available, scaled by `(0.5 + urgency) / 1.5`
//! - **cost**: mean of `1 - profile.cost` and `1 / (1 + usd / 0.01)` for the
//!   estimated request cost, scaled by `(1.5 - budget) / 1.5`
//! - **quality**: profile quality × observed quality × success rate ×
//!   satisfaction factor, scaled by `(0.5 + quality_hint) / 1.5`. The
//!   satisfaction factor is `0.5 + 0.5 × avg_satisfaction` from rated
//!   responses of any user, or 1.0 before any feedback
//! - **suitability**: share of requested capabilities the backend covers
//!
//! The sum is multiplied by `1 + 0.1 × affinity` for the caller's learned
//! preference. Ties go to the backend with more successful calls, then to
//! the lexicographically smallest id.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ledger::PerformanceLedger;
use super::registry::CapabilityRegistry;
use super::types::{
    CapabilityProfile, RequestAnalysis, ScoringWeights, Selection, SelectionReason, TaskCategory,
};

/// Backend used when nothing else is eligible
pub const DEFAULT_BACKEND: &str = "openai/gpt-4o-mini";

/// Backend appended to every fallback chain
pub const DEFAULT_BASELINE_BACKEND: &str = "openai/gpt-4o-mini";

/// Alternates tried after the primary
pub const DEFAULT_MAX_ALTERNATES: usize = 2;

/// Weight of learned user affinity on the total score
pub const AFFINITY_WEIGHT: f64 = 0.1;

/// Request cost (USD) at which the cost curve halves
const COST_SCALE_USD: f64 = 0.01;

/// Selector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub default_backend: String,
    pub baseline_backend: String,
    pub max_alternates: usize,
    pub weights: ScoringWeights,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            default_backend: DEFAULT_BACKEND.to_string(),
            baseline_backend: DEFAULT_BASELINE_BACKEND.to_string(),
            max_alternates: DEFAULT_MAX_ALTERNATES,
            weights: ScoringWeights::default(),
        }
    }
}

/// Score of one eligible backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredBackend {
    pub backend_id: String,
    pub speed: f64,
    pub cost: f64,
    pub quality: f64,
    pub suitability: f64,
    pub affinity: f64,
    pub total: f64,
    /// Successful calls, used for tie-breaking
    pub success_count: u64,
}

/// Ranks backends for a request
#[derive(Debug, Clone)]
pub struct Selector {
    config: SelectorConfig,
    registry: Arc<CapabilityRegistry>,
    ledger: Arc<PerformanceLedger>,
}

impl Selector {
    /// Create a selector over a registry and ledger
    pub fn new(
        config: SelectorConfig,
        registry: Arc<CapabilityRegistry>,
        ledger: Arc<PerformanceLedger>,
    ) -> Self {
        Self {
            config,
            registry,
            ledger,
        }
    }

    /// Selector configuration
    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Whether a profile can serve a request at all
    pub fn is_eligible(profile: &CapabilityProfile, analysis: &RequestAnalysis) -> bool {
        let capable = analysis.category == TaskCategory::General
            || profile.capabilities.contains(&analysis.category);
        capable && analysis.estimated_tokens <= profile.max_tokens
    }

    /// All eligible backends, best first
    pub fn rank(
        &self,
        analysis: &RequestAnalysis,
        weights: Option<&ScoringWeights>,
    ) -> Vec<ScoredBackend> {
        let weights = weights.unwrap_or(&self.config.weights);
        let table = self.registry.snapshot();

        let mut scored: Vec<ScoredBackend> = table
            .values()
            .filter(|profile| Self::is_eligible(profile, analysis))
            .map(|profile| self.score(profile, analysis, weights))
            .collect();

        scored.sort_by(compare_ranked);
        scored
    }

    fn score(
        &self,
        profile: &CapabilityProfile,
        analysis: &RequestAnalysis,
        weights: &ScoringWeights,
    ) -> ScoredBackend {
        let record = self.ledger.get(&profile.id);

        let latency_ms = record
            .as_ref()
            .and_then(|r| r.observed_latency_ms())
            .unwrap_or(profile.avg_response_ms as f64);
        let inverse_latency = 1.0 / (1.0 + latency_ms.max(0.0) / 1_000.0);
        let speed = (profile.speed + inverse_latency) / 2.0 * (0.5 + analysis.urgency) / 1.5;

        let request_cost = profile.estimate_cost(analysis.estimated_tokens);
        let inverse_cost = 1.0 / (1.0 + request_cost.max(0.0) / COST_SCALE_USD);
        let cost = ((1.0 - profile.cost) + inverse_cost) / 2.0 * (1.5 - analysis.budget) / 1.5;

        let (observed_quality, success_rate, satisfaction, success_count) = record
            .as_ref()
            .map(|r| {
                (
                    r.observed_quality(),
                    r.success_rate(),
                    r.satisfaction_factor(),
                    r.success_count,
                )
            })
            .unwrap_or((1.0, 1.0, 1.0, 0));
        let quality = profile.quality * observed_quality * success_rate * satisfaction
            * (0.5 + analysis.quality)
            / 1.5;

        let requested = analysis.requested_capabilities();
        let covered = requested
            .iter()
            .filter(|c| **c == TaskCategory::General || profile.capabilities.contains(c))
            .count();
        let suitability = covered as f64 / requested.len().max(1) as f64;

        let affinity = analysis
            .preferences
            .as_ref()
            .map(|p| p.affinity(&profile.id).clamp(-1.0, 1.0))
            .unwrap_or(0.0);

        let weighted = weights.speed * speed
            + weights.cost * cost
            + weights.quality * quality
            + weights.suitability * suitability;
        let total = weighted * (1.0 + AFFINITY_WEIGHT * affinity);

        ScoredBackend {
            backend_id: profile.id.clone(),
            speed,
            cost,
            quality,
            suitability,
            affinity,
            total,
            success_count,
        }
    }

    /// Pick the primary backend; falls back to the configured default
    pub fn select(&self, analysis: &RequestAnalysis, weights: Option<&ScoringWeights>) -> Selection {
        let ranked = self.rank(analysis, weights);

        let Some(best) = ranked.first() else {
            debug!(
                category = %analysis.category,
                estimated_tokens = analysis.estimated_tokens,
                default = %self.config.default_backend,
                "No eligible backend, using default"
            );
            return Selection {
                backend_id: self.config.default_backend.clone(),
                reason: SelectionReason::NoEligibleBackend,
                alternatives: Vec::new(),
            };
        };

        let reason = if ranked.len() == 1 {
            SelectionReason::SoleCandidate
        } else {
            SelectionReason::BestScore { score: best.total }
        };

        debug!(backend = %best.backend_id, score = best.total, candidates = ranked.len(), "Selected backend");

        Selection {
            backend_id: best.backend_id.clone(),
            reason,
            alternatives: ranked[1..].iter().map(|s| s.backend_id.clone()).collect(),
        }
    }

    /// Primary, then up to `max_alternates` next-best eligible backends, then the baseline
    pub fn build_fallback_chain(
        &self,
        primary: &str,
        analysis: &RequestAnalysis,
        weights: Option<&ScoringWeights>,
    ) -> Vec<String> {
        let mut chain = vec![primary.to_string()];

        chain.extend(
            self.rank(analysis, weights)
                .into_iter()
                .map(|s| s.backend_id)
                .filter(|id| id != primary)
                .take(self.config.max_alternates),
        );

        if !chain.contains(&self.config.baseline_backend) {
            chain.push(self.config.baseline_backend.clone());
        }
        chain
    }
}

/// Higher total first, then more successes, then smaller id
fn compare_ranked(a: &ScoredBackend, b: &ScoredBackend) -> Ordering {
    b.total
        .total_cmp(&a.total)
        .then_with(|| b.success_count.cmp(&a.success_count))
        .then_with(|| a.backend_id.cmp(&b.backend_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::analyzer::RequestAnalyzer;
    use crate::routing::ledger::{Outcome, ResponseAttribution};
    use crate::routing::types::{PreferenceSnapshot, RouteContext};
    use std::collections::BTreeMap;

    fn selector(profiles: Vec<CapabilityProfile>) -> (Selector, Arc<PerformanceLedger>) {
        let registry = Arc::new(CapabilityRegistry::from_profiles(profiles).unwrap());
        let ledger = Arc::new(PerformanceLedger::new());
        let config = SelectorConfig {
            default_backend: "fallback".to_string(),
            baseline_backend: "baseline".to_string(),
            ..SelectorConfig::default()
        };
        (Selector::new(config, registry, ledger.clone()), ledger)
    }

    fn analysis(prompt: &str) -> RequestAnalysis {
        RequestAnalyzer::new().analyze(prompt, &RouteContext::new(), None)
    }

    fn twin(id: &str) -> CapabilityProfile {
        CapabilityProfile::new(id).with_scores(0.5, 0.5, 0.5)
    }

    #[test]
    fn test_no_eligible_backend_returns_default() {
        let (selector, _) = selector(vec![
            CapabilityProfile::new("fast").with_max_tokens(16_000),
            CapabilityProfile::new("smart").with_max_tokens(8_000),
        ]);
        let mut analysis = analysis("hello");
        analysis.estimated_tokens = 20_000;

        let selection = selector.select(&analysis, None);
        assert_eq!(selection.backend_id, "fallback");
        assert_eq!(selection.reason, SelectionReason::NoEligibleBackend);
        assert_eq!(
            selector.build_fallback_chain(&selection.backend_id, &analysis, None),
            vec!["fallback", "baseline"]
        );
    }

    #[test]
    fn test_capability_filter() {
        let (selector, _) = selector(vec![
            CapabilityProfile::new("chatty").with_capabilities([TaskCategory::Conversation]),
            CapabilityProfile::new("coder").with_capabilities([TaskCategory::CodeGeneration]),
        ]);

        let code = analysis("Write a function that parses JSON");
        assert_eq!(code.category, TaskCategory::CodeGeneration);
        let selection = selector.select(&code, None);
        assert_eq!(selection.backend_id, "coder");
        assert_eq!(selection.reason, SelectionReason::SoleCandidate);

        // General requests are served by everyone.
        let general = analysis("What is the capital of Peru");
        assert_eq!(selector.rank(&general, None).len(), 2);
    }

    #[test]
    fn test_quality_heavy_weights_prefer_quality() {
        let (selector, _) = selector(vec![
            CapabilityProfile::new("fast")
                .with_scores(0.95, 0.1, 0.6)
                .with_avg_response_ms(300),
            CapabilityProfile::new("smart")
                .with_scores(0.4, 0.9, 0.98)
                .with_avg_response_ms(4_000),
        ]);
        let request = analysis("What is the capital of Peru");

        let quality = ScoringWeights::new(0.0, 0.0, 1.0, 0.0);
        assert_eq!(selector.select(&request, Some(&quality)).backend_id, "smart");

        let speed = ScoringWeights::new(1.0, 0.0, 0.0, 0.0);
        assert_eq!(selector.select(&request, Some(&speed)).backend_id, "fast");
    }

    #[test]
    fn test_tie_break_by_successes_then_id() {
        let (selector, ledger) = selector(vec![twin("b"), twin("a"), twin("c")]);
        let request = analysis("What is the capital of Peru");

        let ranked: Vec<String> = selector
            .rank(&request, None)
            .into_iter()
            .map(|s| s.backend_id)
            .collect();
        assert_eq!(ranked, vec!["a", "b", "c"]);

        // Same scores, but `c` has more successful history. Identical
        // latency and quality keep the totals equal.
        let outcome = Outcome::Success {
            latency_ms: 2_000,
            quality: 1.0,
        };
        ledger.record("c", outcome.clone());
        ledger.record("b", outcome.clone());
        ledger.record("c", outcome.clone());
        ledger.record("b", outcome.clone());
        ledger.record("c", outcome);

        let ranked: Vec<String> = selector
            .rank(&request, None)
            .into_iter()
            .map(|s| s.backend_id)
            .collect();
        assert_eq!(ranked, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_failures_lower_quality_score() {
        let (selector, ledger) = selector(vec![twin("a"), twin("b")]);
        ledger.record(
            "a",
            Outcome::Failure {
                latency_ms: 10,
                error: "boom".to_string(),
            },
        );

        let request = analysis("What is the capital of Peru");
        assert_eq!(selector.select(&request, None).backend_id, "b");
    }

    #[test]
    fn test_poor_satisfaction_demotes_backend() {
        let (selector, ledger) = selector(vec![twin("a"), twin("b")]);
        let outcome = Outcome::Success {
            latency_ms: 500,
            quality: 0.9,
        };
        ledger.record("a", outcome.clone());
        ledger.record("b", outcome);

        let request = analysis("What is the capital of Peru");
        let before = selector.rank(&request, None);
        assert_eq!(before[0].backend_id, "a");

        ledger.record_response(
            "r-1",
            ResponseAttribution {
                backend_id: "a".to_string(),
                user_id: None,
                category: request.category,
                cached: false,
            },
        );
        ledger.apply_feedback("r-1", 1.0, None).unwrap();

        let after = selector.rank(&request, None);
        assert_eq!(after[0].backend_id, "b");
        let demoted = after.iter().find(|s| s.backend_id == "a").unwrap();
        assert!((demoted.quality - before[0].quality * 0.5).abs() < 1e-9);
        assert!(demoted.total < before[0].total);
    }

    #[test]
    fn test_affinity_biases_total() {
        let (selector, _) = selector(vec![twin("a"), twin("b")]);
        let mut request = analysis("What is the capital of Peru");
        request.preferences = Some(PreferenceSnapshot {
            user_id: "alice".to_string(),
            backend_affinity: BTreeMap::from([("b".to_string(), 1.0)]),
            feedback_count: 3,
        });

        let ranked = selector.rank(&request, None);
        assert_eq!(ranked[0].backend_id, "b");
        assert!((ranked[0].total / ranked[1].total - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_chain_shape() {
        let (selector, _) = selector(vec![twin("a"), twin("b"), twin("c"), twin("d")]);
        let request = analysis("What is the capital of Peru");

        let chain = selector.build_fallback_chain("b", &request, None);
        assert_eq!(chain, vec!["b", "a", "c", "baseline"]);

        // Deterministic for unchanged state.
        assert_eq!(selector.build_fallback_chain("b", &request, None), chain);
    }

    #[test]
    fn test_baseline_not_duplicated() {
        let (selector, _) = selector(vec![twin("a"), twin("baseline")]);
        let request = analysis("What is the capital of Peru");

        let chain = selector.build_fallback_chain("a", &request, None);
        assert_eq!(chain, vec!["a", "baseline"]);
    }

    #[test]
    fn test_sub_scores_bounded() {
        let (selector, _) = selector(vec![
            CapabilityProfile::new("x")
                .with_scores(1.0, 0.0, 1.0)
                .with_avg_response_ms(0)
                .with_cost_per_token(0.0),
        ]);
        let request = RequestAnalyzer::new().analyze(
            "What is the capital of Peru",
            &RouteContext::new()
                .with_urgency(1.0)
                .with_quality(1.0)
                .with_budget(0.0),
            None,
        );

        let scored = &selector.rank(&request, None)[0];
        for value in [scored.speed, scored.cost, scored.quality, scored.suitability] {
            assert!((0.0..=1.0).contains(&value), "{value} out of range");
        }
        assert!((scored.total - 1.0).abs() < 1e-9);
    }
}
