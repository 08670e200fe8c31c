//! Types for inference request routing
//!
//! This module defines the core types shared by the analyzer, selector,
//! executor and cache: task categories, backend capability profiles,
//! per-request analysis, caller context and the routed response.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Closed set of task categories a request can be classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskCategory {
    /// Writing new code
    CodeGeneration,
    /// Reviewing, auditing or debugging existing code
    CodeReview,
    /// Stories, poems, lyrics and other creative text
    CreativeWriting,
    /// Comparing, evaluating, summarizing
    Analysis,
    /// Logic, math, step-by-step problem solving
    Reasoning,
    /// Greetings and small talk
    Conversation,
    /// Translating between languages
    Translation,
    /// Literature and source gathering
    Research,
    /// Anything else; satisfied by every backend
    General,
}

impl TaskCategory {
    /// All categories, in declaration order
    pub const ALL: [TaskCategory; 9] = [
        Self::CodeGeneration,
        Self::CodeReview,
        Self::CreativeWriting,
        Self::Analysis,
        Self::Reasoning,
        Self::Conversation,
        Self::Translation,
        Self::Research,
        Self::General,
    ];
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CodeGeneration => write!(f, "code-generation"),
            Self::CodeReview => write!(f, "code-review"),
            Self::CreativeWriting => write!(f, "creative-writing"),
            Self::Analysis => write!(f, "analysis"),
            Self::Reasoning => write!(f, "reasoning"),
            Self::Conversation => write!(f, "conversation"),
            Self::Translation => write!(f, "translation"),
            Self::Research => write!(f, "research"),
            Self::General => write!(f, "general"),
        }
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|c| c.to_string() == normalized)
            .ok_or_else(|| format!("Unknown task category: {}", s))
    }
}

/// Static description of one backend: speed, cost, quality, capabilities, limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    /// Backend identifier (e.g., "anthropic/claude-sonnet-4-20250514")
    pub id: String,
    /// Relative speed score (0.0 to 1.0)
    pub speed: f64,
    /// Relative cost score (0.0 to 1.0, higher is more expensive)
    pub cost: f64,
    /// Relative quality score (0.0 to 1.0)
    pub quality: f64,
    /// Task categories this backend handles well
    pub capabilities: BTreeSet<TaskCategory>,
    /// Maximum input token budget
    pub max_tokens: usize,
    /// Seed value for average response time before any observation
    pub avg_response_ms: u64,
    /// Cost per token in USD
    pub cost_per_token: f64,
}

impl CapabilityProfile {
    /// Create a new profile with neutral defaults
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            speed: 0.5,
            cost: 0.5,
            quality: 0.5,
            capabilities: BTreeSet::from([TaskCategory::General]),
            max_tokens: 128_000,
            avg_response_ms: 2_000,
            cost_per_token: 0.000_003,
        }
    }

    /// Set speed, cost and quality scores
    pub fn with_scores(mut self, speed: f64, cost: f64, quality: f64) -> Self {
        self.speed = speed.clamp(0.0, 1.0);
        self.cost = cost.clamp(0.0, 1.0);
        self.quality = quality.clamp(0.0, 1.0);
        self
    }

    /// Set supported capabilities
    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = TaskCategory>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    /// Set maximum input tokens
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set seed response time
    pub fn with_avg_response_ms(mut self, ms: u64) -> Self {
        self.avg_response_ms = ms;
        self
    }

    /// Set per-token pricing
    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    /// Estimate the cost of serving a request of the given size
    pub fn estimate_cost(&self, tokens: usize) -> f64 {
        self.cost_per_token * tokens as f64
    }

    /// Check the registration invariants
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidProfile("backend id must not be empty".to_string()));
        }
        if self.capabilities.is_empty() {
            return Err(Error::InvalidProfile(format!(
                "backend '{}' must declare at least one capability",
                self.id
            )));
        }
        if self.max_tokens == 0 {
            return Err(Error::InvalidProfile(format!(
                "backend '{}' must have a positive token budget",
                self.id
            )));
        }
        let scores = [self.speed, self.cost, self.quality];
        if scores.iter().any(|s| !s.is_finite() || !(0.0..=1.0).contains(s)) {
            return Err(Error::InvalidProfile(format!(
                "backend '{}' scores must lie in [0, 1]",
                self.id
            )));
        }
        if !self.cost_per_token.is_finite() || self.cost_per_token < 0.0 {
            return Err(Error::InvalidProfile(format!(
                "backend '{}' cost per token must be non-negative",
                self.id
            )));
        }
        Ok(())
    }
}

/// Weights of the four selector sub-scores
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub speed: f64,
    pub cost: f64,
    pub quality: f64,
    pub suitability: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            speed: 0.3,
            cost: 0.2,
            quality: 0.4,
            suitability: 0.1,
        }
    }
}

impl ScoringWeights {
    /// Create weights from explicit values
    pub fn new(speed: f64, cost: f64, quality: f64, suitability: f64) -> Self {
        Self {
            speed,
            cost,
            quality,
            suitability,
        }
    }

    /// Reject negative, non-finite or all-zero weights
    pub fn validate(&self) -> Result<()> {
        let all = [self.speed, self.cost, self.quality, self.suitability];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::InvalidInput(
                "scoring weights must be finite and non-negative".to_string(),
            ));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(Error::InvalidInput(
                "at least one scoring weight must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Caller-supplied context for a single `route()` call
#[derive(Debug, Clone, Default)]
pub struct RouteContext {
    /// How urgent the answer is (0.0 to 1.0)
    pub urgency: Option<f64>,
    /// How much answer quality matters (0.0 to 1.0)
    pub quality: Option<f64>,
    /// Willingness to spend (0.0 = minimize cost, 1.0 = cost irrelevant)
    pub budget: Option<f64>,
    /// Caller identity for preference lookup
    pub user_id: Option<String>,
    /// Override of the default scoring weights
    pub weights: Option<ScoringWeights>,
    /// Explicit token budget used for cache compatibility
    pub max_tokens: Option<usize>,
    /// Caller-level cancellation
    pub cancellation: Option<CancellationToken>,
}

impl RouteContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set urgency hint
    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.urgency = Some(urgency);
        self
    }

    /// Set quality hint
    pub fn with_quality(mut self, quality: f64) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Set budget hint
    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Set caller identity
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Override scoring weights
    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Set explicit token budget
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Read-only view of a user's learned preferences, captured at analysis time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceSnapshot {
    pub user_id: String,
    /// Per-backend affinity in [-1, 1]
    pub backend_affinity: BTreeMap<String, f64>,
    pub feedback_count: u64,
}

impl PreferenceSnapshot {
    /// Affinity for a backend, 0.0 when unknown
    pub fn affinity(&self, backend_id: &str) -> f64 {
        self.backend_affinity.get(backend_id).copied().unwrap_or(0.0)
    }
}

/// Features derived from a prompt and its context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestAnalysis {
    /// Complexity score (0.0 to 1.0)
    pub complexity: f64,
    /// Task classification
    pub category: TaskCategory,
    pub urgency: f64,
    pub quality: f64,
    pub budget: f64,
    pub has_code: bool,
    pub creative_intent: bool,
    pub reasoning_intent: bool,
    /// Approximate input token count
    pub estimated_tokens: usize,
    /// Largest cached request this request may reuse
    pub token_budget: usize,
    #[serde(default)]
    pub preferences: Option<PreferenceSnapshot>,
    /// Set when some input had to be replaced by defaults
    #[serde(default)]
    pub degraded: bool,
}

impl RequestAnalysis {
    /// Categories this request asks a backend to cover
    pub fn requested_capabilities(&self) -> BTreeSet<TaskCategory> {
        let mut requested = BTreeSet::from([self.category]);
        if self.has_code && self.category != TaskCategory::CodeReview {
            requested.insert(TaskCategory::CodeGeneration);
        }
        if self.reasoning_intent {
            requested.insert(TaskCategory::Reasoning);
        }
        if self.creative_intent {
            requested.insert(TaskCategory::CreativeWriting);
        }
        requested
    }
}

/// Why the selector picked a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SelectionReason {
    /// Highest weighted score among eligible backends
    BestScore { score: f64 },
    /// Only one backend was eligible
    SoleCandidate,
    /// Nothing eligible; configured default used
    NoEligibleBackend,
}

/// Result of a selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub backend_id: String,
    pub reason: SelectionReason,
    /// Other eligible backends, best first
    pub alternatives: Vec<String>,
}

/// Structured response returned by `route()`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutedResponse {
    /// Identifier used to submit feedback for this response
    pub response_id: String,
    pub content: String,
    pub backend_id: String,
    pub duration_ms: u64,
    pub cached: bool,
    /// Number of chain entries that failed before the serving backend
    pub fallbacks_used: usize,
    pub analysis: RequestAnalysis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_category_round_trip_display() {
        for category in TaskCategory::ALL {
            let parsed: TaskCategory = category.to_string().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert_eq!(
            "code_review".parse::<TaskCategory>().unwrap(),
            TaskCategory::CodeReview
        );
        assert!("poetry".parse::<TaskCategory>().is_err());
    }

    #[test]
    fn test_profile_validation() {
        let ok = CapabilityProfile::new("a");
        assert!(ok.validate().is_ok());

        let no_caps = CapabilityProfile::new("a").with_capabilities([]);
        assert!(matches!(no_caps.validate(), Err(Error::InvalidProfile(_))));

        let no_tokens = CapabilityProfile::new("a").with_max_tokens(0);
        assert!(matches!(no_tokens.validate(), Err(Error::InvalidProfile(_))));

        let blank = CapabilityProfile::new("  ");
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_profile_estimate_cost() {
        let profile = CapabilityProfile::new("a").with_cost_per_token(0.000_01);
        assert!((profile.estimate_cost(1_000) - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_weights_validation() {
        assert!(ScoringWeights::default().validate().is_ok());
        assert!(ScoringWeights::new(-0.1, 0.5, 0.5, 0.1).validate().is_err());
        assert!(ScoringWeights::new(f64::NAN, 0.5, 0.5, 0.1).validate().is_err());
        assert!(ScoringWeights::new(0.0, 0.0, 0.0, 0.0).validate().is_err());
    }

    #[test]
    fn test_requested_capabilities_include_flags() {
        let analysis = RequestAnalysis {
            complexity: 0.5,
            category: TaskCategory::Analysis,
            urgency: 0.5,
            quality: 0.5,
            budget: 0.5,
            has_code: true,
            creative_intent: false,
            reasoning_intent: true,
            estimated_tokens: 10,
            token_budget: 20,
            preferences: None,
            degraded: false,
        };

        let requested = analysis.requested_capabilities();
        assert!(requested.contains(&TaskCategory::Analysis));
        assert!(requested.contains(&TaskCategory::CodeGeneration));
        assert!(requested.contains(&TaskCategory::Reasoning));
        assert_eq!(requested.len(), 3);
    }
}
