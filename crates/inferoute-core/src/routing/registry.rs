//! Capability registry
//!
//! Read-mostly table of backend capability profiles. Readers take a cheap
//! `Arc` snapshot of the whole table; reconfiguration builds a new table and
//! swaps it in, so a reader never observes a half-applied update.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use super::types::{CapabilityProfile, TaskCategory};
use crate::error::{Error, Result};

type ProfileTable = HashMap<String, CapabilityProfile>;

/// Registry of available backends with their capabilities
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    table: RwLock<Arc<ProfileTable>>,
}

impl CapabilityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from a list of profiles, validating each one
    pub fn from_profiles(profiles: impl IntoIterator<Item = CapabilityProfile>) -> Result<Self> {
        let registry = Self::new();
        registry.replace_all(profiles)?;
        Ok(registry)
    }

    /// Create a registry with the built-in backend table
    pub fn with_defaults() -> Self {
        let table: ProfileTable = default_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Current table; stays consistent for as long as the caller holds it
    pub fn snapshot(&self) -> Arc<ProfileTable> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get a backend profile by ID
    pub fn get(&self, id: &str) -> Result<CapabilityProfile> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::BackendNotFound(id.to_string()))
    }

    /// Check whether a backend is registered
    pub fn contains(&self, id: &str) -> bool {
        self.snapshot().contains_key(id)
    }

    /// All profiles, ordered by identifier
    pub fn list(&self) -> Vec<CapabilityProfile> {
        let mut profiles: Vec<CapabilityProfile> = self.snapshot().values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Register or replace a single backend
    pub fn register(&self, profile: CapabilityProfile) -> Result<()> {
        profile.validate()?;
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ProfileTable::clone(&guard);
        next.insert(profile.id.clone(), profile);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Remove a backend; returns the removed profile
    pub fn unregister(&self, id: &str) -> Result<CapabilityProfile> {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ProfileTable::clone(&guard);
        let removed = next
            .remove(id)
            .ok_or_else(|| Error::BackendNotFound(id.to_string()))?;
        *guard = Arc::new(next);
        Ok(removed)
    }

    /// Replace the whole table atomically; nothing changes if any profile is invalid
    pub fn replace_all(&self, profiles: impl IntoIterator<Item = CapabilityProfile>) -> Result<()> {
        let mut next = ProfileTable::new();
        for profile in profiles {
            profile.validate()?;
            next.insert(profile.id.clone(), profile);
        }
        let count = next.len();
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        info!(count, "Capability registry replaced");
        Ok(())
    }
}

/// Built-in backend table
pub fn default_profiles() -> Vec<CapabilityProfile> {
    use TaskCategory::*;

    vec![
        // Claude Sonnet 4 - balanced quality/cost
        CapabilityProfile::new("anthropic/claude-sonnet-4-20250514")
            .with_scores(0.7, 0.5, 0.9)
            .with_capabilities([
                CodeGeneration,
                CodeReview,
                Analysis,
                Reasoning,
                CreativeWriting,
                Research,
                Conversation,
                General,
            ])
            .with_max_tokens(200_000)
            .with_avg_response_ms(1_500)
            .with_cost_per_token(0.000_003),
        // Claude Haiku - fast and cheap
        CapabilityProfile::new("anthropic/claude-3-5-haiku-latest")
            .with_scores(0.95, 0.15, 0.7)
            .with_capabilities([Conversation, Translation, Analysis, CodeGeneration, General])
            .with_max_tokens(200_000)
            .with_avg_response_ms(600)
            .with_cost_per_token(0.000_000_8),
        // Claude Opus - highest quality
        CapabilityProfile::new("anthropic/claude-opus-4-20250514")
            .with_scores(0.35, 1.0, 1.0)
            .with_capabilities([
                CodeGeneration,
                CodeReview,
                Analysis,
                Reasoning,
                CreativeWriting,
                Research,
                General,
            ])
            .with_max_tokens(200_000)
            .with_avg_response_ms(4_000)
            .with_cost_per_token(0.000_015),
        // GPT-4o - general purpose
        CapabilityProfile::new("openai/gpt-4o")
            .with_scores(0.75, 0.45, 0.85)
            .with_capabilities([
                CodeGeneration,
                Analysis,
                Reasoning,
                Translation,
                CreativeWriting,
                Conversation,
                General,
            ])
            .with_max_tokens(128_000)
            .with_avg_response_ms(1_200)
            .with_cost_per_token(0.000_002_5),
        // GPT-4o-mini - fast and cheap, always-available baseline
        CapabilityProfile::new("openai/gpt-4o-mini")
            .with_scores(0.95, 0.05, 0.65)
            .with_capabilities([Conversation, Translation, General])
            .with_max_tokens(128_000)
            .with_avg_response_ms(500)
            .with_cost_per_token(0.000_000_15),
    ]
}
