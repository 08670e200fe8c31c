//! User preference profiles
//!
//! A profile is created on a user's first feedback event and never removed
//! automatically. It keeps the most recent ratings, a per-category count of
//! routed requests and a per-backend affinity in [-1, 1] that biases the
//! selector.
//!
//! Affinity is the decay-weighted mean of re-centered ratings
//! (`2 × satisfaction - 1`) for that backend, newest rating weight 1.0 and
//! each older one [`AFFINITY_DECAY`] times the previous. The mean is then
//! scaled by a freshness factor that halves every
//! [`AFFINITY_HALF_LIFE_DAYS`] whole days since the newest rating for that
//! backend, so preferences a user stopped expressing fade toward neutral.
//!
//! Feedback refreshes the affected affinity immediately. The periodic
//! adaptation pass ([`PreferenceStore::adapt`]) recomputes every affinity
//! against the current date, which is what applies the fading, and also
//! repairs affinities restored from an inconsistent snapshot.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{PreferenceSnapshot, TaskCategory};

/// Ratings retained per user
pub const RATING_HISTORY_LIMIT: usize = 50;

/// Weight multiplier per position away from the newest rating
pub const AFFINITY_DECAY: f64 = 0.9;

/// Days after which an unrefreshed affinity counts half
pub const AFFINITY_HALF_LIFE_DAYS: f64 = 30.0;

/// Default period of the background adaptation pass
pub const DEFAULT_ADAPTATION_INTERVAL_SECS: u64 = 300;

/// One rating given by a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub backend_id: String,
    pub category: TaskCategory,
    /// Rating mapped onto [0, 1]
    pub satisfaction: f64,
    pub at: DateTime<Utc>,
}

/// Learned preferences of one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferenceProfile {
    #[serde(default)]
    pub user_id: String,
    /// Most recent ratings, oldest first
    #[serde(default)]
    pub ratings: VecDeque<RatingRecord>,
    /// Requests routed per category
    #[serde(default)]
    pub task_history: BTreeMap<TaskCategory, u64>,
    #[serde(default)]
    pub backend_affinity: BTreeMap<String, f64>,
    #[serde(default)]
    pub feedback_count: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl UserPreferenceProfile {
    /// Create an empty profile
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            ratings: VecDeque::new(),
            task_history: BTreeMap::new(),
            backend_affinity: BTreeMap::new(),
            feedback_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Category this user routes most often
    pub fn favourite_category(&self) -> Option<TaskCategory> {
        self.task_history
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(category, _)| *category)
    }

    /// Read-only view handed to the analyzer
    pub fn snapshot(&self) -> PreferenceSnapshot {
        PreferenceSnapshot {
            user_id: self.user_id.clone(),
            backend_affinity: self.backend_affinity.clone(),
            feedback_count: self.feedback_count,
        }
    }

    fn push_rating(&mut self, rating: RatingRecord) {
        let backend_id = rating.backend_id.clone();
        if self.ratings.len() >= RATING_HISTORY_LIMIT {
            self.ratings.pop_front();
        }
        self.ratings.push_back(rating);
        self.feedback_count += 1;
        self.updated_at = Utc::now();
        self.refresh_affinity(&backend_id);
    }

    fn refresh_affinity(&mut self, backend_id: &str) {
        match decayed_affinity(&self.ratings, backend_id, Utc::now()) {
            Some(affinity) => {
                self.backend_affinity.insert(backend_id.to_string(), affinity);
            }
            None => {
                self.backend_affinity.remove(backend_id);
            }
        }
    }

    /// Recompute every affinity from the retained ratings as of `now`
    fn recompute(&mut self, now: DateTime<Utc>) -> bool {
        let next: BTreeMap<String, f64> = self
            .ratings
            .iter()
            .map(|r| r.backend_id.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| decayed_affinity(&self.ratings, id, now).map(|a| (id.to_string(), a)))
            .collect();

        let changed = next != self.backend_affinity;
        self.backend_affinity = next;
        changed
    }
}

fn decayed_affinity(
    ratings: &VecDeque<RatingRecord>,
    backend_id: &str,
    now: DateTime<Utc>,
) -> Option<f64> {
    let mut weight = 1.0;
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    let mut newest: Option<DateTime<Utc>> = None;

    for rating in ratings.iter().rev().filter(|r| r.backend_id == backend_id) {
        newest = Some(newest.map_or(rating.at, |at| at.max(rating.at)));
        let centered = 2.0 * rating.satisfaction.clamp(0.0, 1.0) - 1.0;
        weighted_sum += weight * centered;
        total_weight += weight;
        weight *= AFFINITY_DECAY;
    }

    if total_weight == 0.0 {
        return None;
    }

    // Whole days keep repeated passes within a day stable
    let idle_days = newest.map_or(0, |at| (now - at).num_days().max(0));
    let freshness = 0.5_f64.powf(idle_days as f64 / AFFINITY_HALF_LIFE_DAYS);
    Some((weighted_sum / total_weight * freshness).clamp(-1.0, 1.0))
}

/// All user profiles owned by one router
#[derive(Debug, Default)]
pub struct PreferenceStore {
    profiles: RwLock<HashMap<String, UserPreferenceProfile>>,
    adaptation_passes: AtomicU64,
}

impl PreferenceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Preference view for a user, if a profile exists
    pub fn snapshot(&self, user_id: &str) -> Option<PreferenceSnapshot> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(UserPreferenceProfile::snapshot)
    }

    /// Full profile for a user
    pub fn get(&self, user_id: &str) -> Option<UserPreferenceProfile> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    /// Record a rating; creates the profile on first feedback
    pub fn record_feedback(
        &self,
        user_id: &str,
        backend_id: &str,
        category: TaskCategory,
        satisfaction: f64,
    ) {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| UserPreferenceProfile::new(user_id));

        profile.push_rating(RatingRecord {
            backend_id: backend_id.to_string(),
            category,
            satisfaction,
            at: Utc::now(),
        });

        debug!(
            user = %user_id,
            backend = %backend_id,
            affinity = profile.backend_affinity.get(backend_id).copied().unwrap_or(0.0),
            "Updated user preference"
        );
    }

    /// Count a routed request for an existing profile
    pub fn record_task(&self, user_id: &str, category: TaskCategory) {
        let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(profile) = profiles.get_mut(user_id) {
            *profile.task_history.entry(category).or_insert(0) += 1;
        }
    }

    /// Recompute every user's affinities as of now; returns how many profiles changed
    pub fn adapt(&self) -> usize {
        let now = Utc::now();
        let changed = {
            let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
            profiles
                .values_mut()
                .map(|profile| profile.recompute(now))
                .filter(|changed| *changed)
                .count()
        };
        self.adaptation_passes.fetch_add(1, Ordering::Relaxed);
        debug!(changed, "Preference adaptation pass complete");
        changed
    }

    /// Number of completed adaptation passes
    pub fn adaptation_passes(&self) -> u64 {
        self.adaptation_passes.load(Ordering::Relaxed)
    }

    /// Copy of every profile, ordered by user id
    pub fn export(&self) -> BTreeMap<String, UserPreferenceProfile> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, profile)| (id.clone(), profile.clone()))
            .collect()
    }

    /// Replace every profile; affinities are recomputed from the ratings
    pub fn restore(&self, profiles: impl IntoIterator<Item = UserPreferenceProfile>) {
        let now = Utc::now();
        let mut next = HashMap::new();
        for mut profile in profiles {
            while profile.ratings.len() > RATING_HISTORY_LIMIT {
                profile.ratings.pop_front();
            }
            profile.recompute(now);
            next.insert(profile.user_id.clone(), profile);
        }
        *self.profiles.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Number of profiles
    pub fn len(&self) -> usize {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no profile exists
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run [`PreferenceStore::adapt`] every `interval` until `cancel` fires
pub fn spawn_adaptation(
    store: Arc<PreferenceStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        info!(interval_secs = interval.as_secs(), "Preference adaptation started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    store.adapt();
                }
            }
        }

        info!("Preference adaptation stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_created_on_first_feedback() {
        let store = PreferenceStore::new();
        assert!(store.snapshot("alice").is_none());

        store.record_feedback("alice", "a", TaskCategory::General, 1.0);
        let snapshot = store.snapshot("alice").unwrap();
        assert_eq!(snapshot.feedback_count, 1);
        assert_eq!(snapshot.affinity("a"), 1.0);
        assert_eq!(snapshot.affinity("unknown"), 0.0);
    }

    #[test]
    fn test_affinity_decays_older_ratings() {
        let store = PreferenceStore::new();
        store.record_feedback("alice", "a", TaskCategory::General, 0.0);
        store.record_feedback("alice", "a", TaskCategory::General, 1.0);

        // Newest (+1) weighs 1.0, older (-1) weighs 0.9.
        let expected = (1.0 - 0.9) / 1.9;
        let affinity = store.snapshot("alice").unwrap().affinity("a");
        assert!((affinity - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rating_history_is_capped() {
        let store = PreferenceStore::new();
        for _ in 0..(RATING_HISTORY_LIMIT + 10) {
            store.record_feedback("alice", "a", TaskCategory::General, 0.75);
        }
        let profile = store.get("alice").unwrap();
        assert_eq!(profile.ratings.len(), RATING_HISTORY_LIMIT);
        assert_eq!(profile.feedback_count, (RATING_HISTORY_LIMIT + 10) as u64);
    }

    #[test]
    fn test_task_history_only_for_known_users() {
        let store = PreferenceStore::new();
        store.record_task("ghost", TaskCategory::Analysis);
        assert!(store.is_empty());

        store.record_feedback("alice", "a", TaskCategory::General, 0.5);
        store.record_task("alice", TaskCategory::Analysis);
        store.record_task("alice", TaskCategory::Analysis);
        store.record_task("alice", TaskCategory::Translation);

        let profile = store.get("alice").unwrap();
        assert_eq!(profile.task_history[&TaskCategory::Analysis], 2);
        assert_eq!(profile.favourite_category(), Some(TaskCategory::Analysis));
    }

    #[test]
    fn test_adapt_repairs_tampered_affinity() {
        let store = PreferenceStore::new();
        store.record_feedback("alice", "a", TaskCategory::General, 1.0);

        let mut profile = store.get("alice").unwrap();
        profile.backend_affinity.insert("stale".to_string(), -1.0);
        *store
            .profiles
            .write()
            .unwrap()
            .get_mut("alice")
            .unwrap() = profile;

        assert_eq!(store.adapt(), 1);
        assert_eq!(store.adapt(), 0);
        let snapshot = store.snapshot("alice").unwrap();
        assert_eq!(snapshot.affinity("stale"), 0.0);
        assert_eq!(snapshot.affinity("a"), 1.0);
        assert_eq!(store.adaptation_passes(), 2);
    }

    #[test]
    fn test_adapt_fades_idle_affinity() {
        let store = PreferenceStore::new();
        store.record_feedback("alice", "a", TaskCategory::General, 1.0);
        store.record_feedback("alice", "b", TaskCategory::General, 0.0);

        // Pass on the same day changes nothing
        assert_eq!(store.adapt(), 0);

        {
            let mut profiles = store.profiles.write().unwrap();
            let profile = profiles.get_mut("alice").unwrap();
            for rating in profile.ratings.iter_mut().filter(|r| r.backend_id == "a") {
                rating.at -= chrono::Duration::days(30);
            }
        }

        assert_eq!(store.adapt(), 1);
        let snapshot = store.snapshot("alice").unwrap();
        assert!((snapshot.affinity("a") - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.affinity("b"), -1.0);

        // A fresh rating restores full strength
        store.record_feedback("alice", "a", TaskCategory::General, 1.0);
        assert_eq!(store.snapshot("alice").unwrap().affinity("a"), 1.0);
    }

    #[test]
    fn test_export_restore() {
        let store = PreferenceStore::new();
        store.record_feedback("alice", "a", TaskCategory::General, 1.0);
        store.record_feedback("bob", "b", TaskCategory::Analysis, 0.0);

        let restored = PreferenceStore::new();
        restored.restore(store.export().into_values());
        assert_eq!(restored.export(), store.export());
        assert_eq!(restored.snapshot("bob").unwrap().affinity("b"), -1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_adaptation_runs_and_stops() {
        let store = Arc::new(PreferenceStore::new());
        let cancel = CancellationToken::new();
        let handle = spawn_adaptation(store.clone(), Duration::from_secs(300), cancel.clone());

        tokio::time::sleep(Duration::from_secs(601)).await;
        assert_eq!(store.adaptation_passes(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
