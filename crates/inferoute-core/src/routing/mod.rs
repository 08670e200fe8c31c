//! Adaptive inference request routing
//!
//! Given a prompt and a context, the router picks which language-model
//! backend should answer, calls it through a fallback chain, learns from the
//! outcome and reuses earlier answers for sufficiently similar prompts.
//!
//! - **Request Analyzer**: complexity score, task category, intent flags and
//!   token estimate for a prompt.
//!
//! - **Capability Registry**: table of backends with their speed, cost,
//!   quality, capabilities and token limits. Reconfiguration swaps the whole
//!   table at once.
//!
//! - **Selector**: filters eligible backends, scores them with weighted
//!   speed/cost/quality/suitability and builds the fallback chain.
//!
//! - **Execution Engine**: walks the chain with a per-call timeout until a
//!   backend answers.
//!
//! - **Performance Ledger**: rolling per-backend statistics, updated on every
//!   call and every piece of user feedback.
//!
//! - **Semantic Cache**: bounded LRU store of served responses matched by
//!   cosine similarity of hashed bag-of-words embeddings.
//!
//! - **Preference Store**: per-user backend affinities learned from ratings,
//!   re-derived periodically by a background pass.
//!
//! - **Snapshot Store**: SQLite persistence of exported router state.
//!
//! ## How It Works
//!
//! 1. The analyzer derives a [`RequestAnalysis`] from the prompt
//! 2. The semantic cache is consulted; a compatible hit is returned directly
//! 3. Otherwise the selector ranks eligible backends and builds a chain
//! 4. The executor tries the chain in order, recording every outcome
//! 5. The answer is cached and its response id remembered for feedback
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use inferoute_core::backend::EchoBackend;
//! use inferoute_core::routing::{InferenceRouter, RouteContext};
//!
//! let router = InferenceRouter::builder()
//!     .backend(Arc::new(EchoBackend::new("openai/gpt-4o-mini")))
//!     .build()?;
//!
//! let response = router
//!     .route("Explain borrowing in Rust", RouteContext::new().with_user("alice"))
//!     .await?;
//!
//! // Later, once the user has read the answer
//! router.submit_feedback(&response.response_id, 5.0, None, None);
//! ```

mod analyzer;
mod cache;
mod embedding;
mod events;
mod executor;
mod ledger;
mod preferences;
mod registry;
mod router;
mod selector;
mod snapshot;
mod store;
mod types;

pub use analyzer::{CHARS_PER_TOKEN, RequestAnalyzer, complexity_score, estimate_tokens};
pub use cache::{
    CacheEntry, CacheHit, CacheRecord, CacheStats, CachedResponse, DEFAULT_CAPACITY,
    DEFAULT_SIMILARITY_THRESHOLD, SemanticCache, SemanticCacheConfig,
};
pub use embedding::{DEFAULT_DIMENSIONS, Embedder, HashingEmbedder, cosine_similarity, tokenize};
pub use events::{DEFAULT_EVENT_CAPACITY, EventBus, RouterEvent, RouterEventKind};
pub use executor::{DEFAULT_CALL_TIMEOUT, Execution, ExecutionEngine, estimate_quality};
pub use ledger::{
    AppliedFeedback, DEFAULT_RESPONSE_LOG_CAPACITY, ERROR_HISTORY_LIMIT, ErrorRecord,
    LedgerSummary, Outcome, PerformanceLedger, PerformanceRecord, RecentResponse,
    ResponseAttribution, SMOOTHING, validate_feedback,
};
pub use preferences::{
    DEFAULT_ADAPTATION_INTERVAL_SECS, PreferenceStore, RatingRecord, UserPreferenceProfile,
    spawn_adaptation,
};
pub use registry::{CapabilityRegistry, default_profiles};
pub use router::{FeedbackOutcome, InferenceRouter, InferenceRouterBuilder};
pub use selector::{ScoredBackend, Selector, SelectorConfig};
pub use snapshot::{CACHE_SAMPLE_LIMIT, RESPONSE_SAMPLE_LIMIT, RouterSnapshot, SNAPSHOT_VERSION};
pub use store::{CREATE_SNAPSHOTS_TABLE_SQL, SnapshotStore, StoredSnapshot};
pub use types::{
    CapabilityProfile, PreferenceSnapshot, RequestAnalysis, RouteContext, RoutedResponse,
    ScoringWeights, Selection, SelectionReason, TaskCategory,
};
