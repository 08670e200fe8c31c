//! Performance ledger
//!
//! Rolling per-backend statistics read by the selector and written by the
//! executor and the feedback channel.
//!
//! Each backend owns its own record behind its own mutex, so updates for
//! unrelated backends never contend. Averages use an exponential blend with
//! smoothing factor [`SMOOTHING`]: `new = old + 0.5 × (sample - old)`, the
//! first sample being taken as is. The blend is a convex combination, so it
//! stays within the range of observed samples and cannot diverge.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::TaskCategory;
use crate::error::{Error, Result};

/// Maximum number of remembered errors per backend
pub const ERROR_HISTORY_LIMIT: usize = 10;

/// Weight of a new sample in every rolling average
pub const SMOOTHING: f64 = 0.5;

/// Default capacity of the response attribution log
pub const DEFAULT_RESPONSE_LOG_CAPACITY: usize = 10_000;

/// Lowest accepted rating
pub const MIN_RATING: f64 = 1.0;

/// Highest accepted rating
pub const MAX_RATING: f64 = 5.0;

/// Longest accepted feedback comment, in characters
pub const MAX_COMMENT_CHARS: usize = 4_096;

/// One remembered backend failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Rolling statistics for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    #[serde(default)]
    pub backend_id: String,
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub success_count: u64,
    /// Rolling latency of successful calls
    #[serde(default)]
    pub avg_latency_ms: Option<f64>,
    /// Rolling estimated response quality (0.0 to 1.0)
    #[serde(default)]
    pub avg_quality: Option<f64>,
    /// Rolling user satisfaction from feedback (0.0 to 1.0)
    #[serde(default)]
    pub avg_satisfaction: Option<f64>,
    #[serde(default)]
    pub feedback_count: u64,
    /// Most recent errors, oldest first
    #[serde(default)]
    pub recent_errors: VecDeque<ErrorRecord>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl PerformanceRecord {
    /// Create an empty record
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            total_calls: 0,
            success_count: 0,
            avg_latency_ms: None,
            avg_quality: None,
            avg_satisfaction: None,
            feedback_count: 0,
            recent_errors: VecDeque::new(),
            last_used: None,
        }
    }

    /// Number of failed calls
    pub fn failure_count(&self) -> u64 {
        self.total_calls.saturating_sub(self.success_count)
    }

    /// Fraction of successful calls; 1.0 without history
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.total_calls as f64
    }

    /// Observed quality; 1.0 without history
    pub fn observed_quality(&self) -> f64 {
        self.avg_quality.unwrap_or(1.0)
    }

    /// Quality multiplier from user feedback: 0.5 at the worst average
    /// rating, 1.0 at the best or without feedback
    pub fn satisfaction_factor(&self) -> f64 {
        self.avg_satisfaction
            .map_or(1.0, |s| 0.5 + 0.5 * s.clamp(0.0, 1.0))
    }

    /// Observed latency, if any call has succeeded
    pub fn observed_latency_ms(&self) -> Option<f64> {
        self.avg_latency_ms
    }

    fn apply(&mut self, outcome: &Outcome) {
        self.total_calls += 1;
        self.last_used = Some(Utc::now());

        match outcome {
            Outcome::Success {
                latency_ms,
                quality,
            } => {
                self.success_count += 1;
                blend(&mut self.avg_latency_ms, *latency_ms as f64);
                blend(&mut self.avg_quality, quality.clamp(0.0, 1.0));
            }
            Outcome::Failure { error, .. } => {
                if self.recent_errors.len() >= ERROR_HISTORY_LIMIT {
                    self.recent_errors.pop_front();
                }
                self.recent_errors.push_back(ErrorRecord {
                    at: Utc::now(),
                    message: error.clone(),
                });
            }
        }
    }

    /// Repair counters restored from an untrusted snapshot
    fn sanitize(mut self) -> Self {
        self.success_count = self.success_count.min(self.total_calls);
        for avg in [
            &mut self.avg_quality,
            &mut self.avg_satisfaction,
        ] {
            *avg = avg.filter(|v| v.is_finite()).map(|v| v.clamp(0.0, 1.0));
        }
        self.avg_latency_ms = self
            .avg_latency_ms
            .filter(|v| v.is_finite() && *v >= 0.0);
        while self.recent_errors.len() > ERROR_HISTORY_LIMIT {
            self.recent_errors.pop_front();
        }
        self
    }
}

fn blend(avg: &mut Option<f64>, sample: f64) {
    *avg = Some(match *avg {
        Some(old) => old + SMOOTHING * (sample - old),
        None => sample,
    });
}

/// Result of one backend invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success { latency_ms: u64, quality: f64 },
    /// Latency of failed calls is reported but not blended into the average
    Failure { latency_ms: u64, error: String },
}

/// Who served a response, remembered for later feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseAttribution {
    pub backend_id: String,
    pub user_id: Option<String>,
    pub category: TaskCategory,
    pub cached: bool,
}

/// One entry of the response attribution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentResponse {
    pub response_id: String,
    #[serde(flatten)]
    pub attribution: ResponseAttribution,
}

/// Feedback that matched a known response
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedFeedback {
    pub response_id: String,
    pub attribution: ResponseAttribution,
    /// Rating mapped onto [0, 1]
    pub satisfaction: f64,
}

/// Aggregate view across all backends
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub backends: usize,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_feedback: u64,
}

impl LedgerSummary {
    /// Overall success rate; 0.0 without calls
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }
}

#[derive(Debug)]
struct ResponseLog {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, ResponseAttribution>,
}

impl ResponseLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, response_id: String, attribution: ResponseAttribution) {
        if self.entries.insert(response_id.clone(), attribution).is_some() {
            return;
        }
        self.order.push_back(response_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Per-backend performance statistics
#[derive(Debug)]
pub struct PerformanceLedger {
    records: DashMap<String, Arc<Mutex<PerformanceRecord>>>,
    responses: Mutex<ResponseLog>,
}

impl Default for PerformanceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::with_response_log_capacity(DEFAULT_RESPONSE_LOG_CAPACITY)
    }

    /// Create an empty ledger remembering at most `capacity` response ids
    pub fn with_response_log_capacity(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            responses: Mutex::new(ResponseLog::new(capacity)),
        }
    }

    fn record_handle(&self, backend_id: &str) -> Arc<Mutex<PerformanceRecord>> {
        if let Some(existing) = self.records.get(backend_id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .records
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(PerformanceRecord::new(backend_id))));
        Arc::clone(entry.value())
    }

    /// Record the outcome of one backend call
    pub fn record(&self, backend_id: &str, outcome: Outcome) {
        let handle = self.record_handle(backend_id);
        let mut record = handle.lock().unwrap_or_else(PoisonError::into_inner);
        record.apply(&outcome);

        debug!(
            backend = %backend_id,
            total_calls = record.total_calls,
            success_count = record.success_count,
            "Recorded backend outcome"
        );
    }

    /// Current statistics for a backend
    pub fn get(&self, backend_id: &str) -> Option<PerformanceRecord> {
        let handle = Arc::clone(self.records.get(backend_id)?.value());
        let record = handle.lock().unwrap_or_else(PoisonError::into_inner);
        Some(record.clone())
    }

    /// Remember who served a response so feedback can be attributed
    pub fn record_response(&self, response_id: &str, attribution: ResponseAttribution) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(response_id.to_string(), attribution);
    }

    /// Attribution of a served response
    pub fn attribution(&self, response_id: &str) -> Option<ResponseAttribution> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(response_id)
            .cloned()
    }

    /// The `n` most recently served response ids, oldest first
    pub fn recent_responses(&self, n: usize) -> Vec<RecentResponse> {
        let log = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = log.order.len().saturating_sub(n);
        log.order
            .iter()
            .skip(skip)
            .filter_map(|id| {
                log.entries.get(id).map(|attribution| RecentResponse {
                    response_id: id.clone(),
                    attribution: attribution.clone(),
                })
            })
            .collect()
    }

    /// Replace the attribution log; entries are given oldest first
    pub fn restore_responses(&self, responses: impl IntoIterator<Item = RecentResponse>) {
        let mut log = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        log.order.clear();
        log.entries.clear();
        for response in responses {
            log.insert(response.response_id, response.attribution);
        }
    }

    /// Apply a user rating (1 to 5) to the backend that served `response_id`.
    ///
    /// Unknown response ids are ignored and yield `Ok(None)`. Malformed
    /// ratings or comments yield [`Error::InvalidFeedback`].
    pub fn apply_feedback(
        &self,
        response_id: &str,
        rating: f64,
        comment: Option<&str>,
    ) -> Result<Option<AppliedFeedback>> {
        let satisfaction = validate_feedback(rating, comment)?;

        let Some(attribution) = self.attribution(response_id) else {
            debug!(response_id = %response_id, "Feedback for unknown response ignored");
            return Ok(None);
        };

        let handle = self.record_handle(&attribution.backend_id);
        {
            let mut record = handle.lock().unwrap_or_else(PoisonError::into_inner);
            record.feedback_count += 1;
            blend(&mut record.avg_satisfaction, satisfaction);
        }

        debug!(
            response_id = %response_id,
            backend = %attribution.backend_id,
            satisfaction,
            has_comment = comment.is_some(),
            "Applied feedback"
        );

        Ok(Some(AppliedFeedback {
            response_id: response_id.to_string(),
            attribution,
            satisfaction,
        }))
    }

    /// Copy of every record, ordered by backend id
    pub fn snapshot(&self) -> BTreeMap<String, PerformanceRecord> {
        let handles: Vec<(String, Arc<Mutex<PerformanceRecord>>)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        handles
            .into_iter()
            .map(|(id, handle)| {
                let record = handle.lock().unwrap_or_else(PoisonError::into_inner);
                (id, record.clone())
            })
            .collect()
    }

    /// Replace every record
    pub fn restore(&self, records: impl IntoIterator<Item = PerformanceRecord>) {
        self.records.clear();
        for record in records {
            if record.backend_id.trim().is_empty() {
                warn!("Skipping performance record without backend id");
                continue;
            }
            let record = record.sanitize();
            self.records
                .insert(record.backend_id.clone(), Arc::new(Mutex::new(record)));
        }
    }

    /// Drop all statistics and forget served responses
    pub fn reset(&self) {
        self.records.clear();
        let mut responses = self.responses.lock().unwrap_or_else(PoisonError::into_inner);
        responses.order.clear();
        responses.entries.clear();
    }

    /// Totals across all backends
    pub fn summary(&self) -> LedgerSummary {
        let snapshot = self.snapshot();
        LedgerSummary {
            backends: snapshot.len(),
            total_calls: snapshot.values().map(|r| r.total_calls).sum(),
            total_successes: snapshot.values().map(|r| r.success_count).sum(),
            total_feedback: snapshot.values().map(|r| r.feedback_count).sum(),
        }
    }
}

/// Check a rating and comment; returns the rating mapped onto [0, 1]
pub fn validate_feedback(rating: f64, comment: Option<&str>) -> Result<f64> {
    if !rating.is_finite() || !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(Error::InvalidFeedback(format!(
            "rating must be between {} and {}, got {}",
            MIN_RATING, MAX_RATING, rating
        )));
    }
    if comment.is_some_and(|c| c.chars().count() > MAX_COMMENT_CHARS) {
        return Err(Error::InvalidFeedback(format!(
            "comment exceeds {} characters",
            MAX_COMMENT_CHARS
        )));
    }
    Ok((rating - MIN_RATING) / (MAX_RATING - MIN_RATING))
}
