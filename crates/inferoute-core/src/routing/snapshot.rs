//! Router state snapshots
//!
//! [`RouterSnapshot`] is the portable export of a router: capability table,
//! performance ledger, user preferences and a sample of the newest cache
//! entries, plus the most recent response attributions so feedback can
//! still be matched after a restart. Parsing from JSON is lenient. Unknown fields are ignored and
//! individually broken entries are skipped with a warning. Only a payload
//! whose overall shape is wrong is rejected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::cache::CacheRecord;
use super::ledger::{PerformanceRecord, RecentResponse};
use super::preferences::UserPreferenceProfile;
use super::types::CapabilityProfile;
use crate::error::{Error, Result};

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Cache entries included in an export
pub const CACHE_SAMPLE_LIMIT: usize = 100;

/// Response attributions included in an export
pub const RESPONSE_SAMPLE_LIMIT: usize = 1_000;

fn current_version() -> u32 {
    SNAPSHOT_VERSION
}

/// Exported router state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterSnapshot {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub exported_at: DateTime<Utc>,
    /// Capability table; empty leaves the importing router's table unchanged
    #[serde(default)]
    pub registry: Vec<CapabilityProfile>,
    #[serde(default)]
    pub performance: BTreeMap<String, PerformanceRecord>,
    #[serde(default)]
    pub preferences: BTreeMap<String, UserPreferenceProfile>,
    /// Newest cache entries, newest first
    #[serde(default)]
    pub cache_sample: Vec<CacheRecord>,
    /// Recently served responses, oldest first
    #[serde(default)]
    pub responses: Vec<RecentResponse>,
}

impl Default for RouterSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            registry: Vec::new(),
            performance: BTreeMap::new(),
            preferences: BTreeMap::new(),
            cache_sample: Vec::new(),
            responses: Vec::new(),
        }
    }
}

impl RouterSnapshot {
    /// Serialize to a JSON value
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse a snapshot leniently.
    ///
    /// Fails with [`Error::InvalidSnapshot`] when the payload is not an
    /// object, declares a newer version, or has a section of the wrong
    /// type. Broken entries inside a section are dropped.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(Error::InvalidSnapshot(
                "snapshot must be a JSON object".to_string(),
            ));
        };

        let version = match object.remove("version") {
            None | Some(Value::Null) => SNAPSHOT_VERSION,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    Error::InvalidSnapshot("version must be a non-negative integer".to_string())
                })?,
        };
        if version > SNAPSHOT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "snapshot version {} is newer than supported version {}",
                version, SNAPSHOT_VERSION
            )));
        }

        let exported_at = object
            .remove("exported_at")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(Utc::now);

        let registry: Vec<CapabilityProfile> = array_section(&mut object, "registry")?
            .into_iter()
            .filter(|profile: &CapabilityProfile| match profile.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Skipping invalid capability profile in snapshot");
                    false
                }
            })
            .collect();

        let performance = map_section::<PerformanceRecord>(&mut object, "performance")?
            .into_iter()
            .map(|(id, mut record)| {
                record.backend_id = id.clone();
                (id, record)
            })
            .collect();

        let preferences = map_section::<UserPreferenceProfile>(&mut object, "preferences")?
            .into_iter()
            .map(|(id, mut profile)| {
                profile.user_id = id.clone();
                (id, profile)
            })
            .collect();

        let mut cache_sample: Vec<CacheRecord> = array_section(&mut object, "cache_sample")?;
        cache_sample.truncate(CACHE_SAMPLE_LIMIT);

        let mut responses: Vec<RecentResponse> = array_section(&mut object, "responses")?;
        let excess = responses.len().saturating_sub(RESPONSE_SAMPLE_LIMIT);
        responses.drain(..excess);

        Ok(Self {
            version,
            exported_at,
            registry,
            performance,
            preferences,
            cache_sample,
            responses,
        })
    }
}

fn array_section<T: DeserializeOwned>(
    object: &mut serde_json::Map<String, Value>,
    name: &str,
) -> Result<Vec<T>> {
    let items = match object.remove(name) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(_) => {
            return Err(Error::InvalidSnapshot(format!(
                "section '{}' must be an array",
                name
            )));
        }
    };

    Ok(items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(section = name, index, error = %e, "Skipping malformed snapshot entry");
                None
            }
        })
        .collect())
}

fn map_section<T: DeserializeOwned>(
    object: &mut serde_json::Map<String, Value>,
    name: &str,
) -> Result<BTreeMap<String, T>> {
    let entries = match object.remove(name) {
        None | Some(Value::Null) => return Ok(BTreeMap::new()),
        Some(Value::Object(entries)) => entries,
        Some(_) => {
            return Err(Error::InvalidSnapshot(format!(
                "section '{}' must be an object",
                name
            )));
        }
    };

    Ok(entries
        .into_iter()
        .filter_map(|(key, item)| match serde_json::from_value(item) {
            Ok(parsed) => Some((key, parsed)),
            Err(e) => {
                warn!(section = name, key = %key, error = %e, "Skipping malformed snapshot entry");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rejects_wrong_shape() {
        for bad in [json!([]), json!("snapshot"), json!(null)] {
            assert!(matches!(
                RouterSnapshot::from_json(bad),
                Err(Error::InvalidSnapshot(_))
            ));
        }
        assert!(RouterSnapshot::from_json(json!({"registry": {}})).is_err());
        assert!(RouterSnapshot::from_json(json!({"performance": []})).is_err());
        assert!(RouterSnapshot::from_json(json!({"version": SNAPSHOT_VERSION + 1})).is_err());
        assert!(RouterSnapshot::from_json(json!({"version": "one"})).is_err());
    }

    #[test]
    fn test_empty_object_is_empty_snapshot() {
        let snapshot = RouterSnapshot::from_json(json!({})).unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert!(snapshot.registry.is_empty());
        assert!(snapshot.performance.is_empty());
    }

    #[test]
    fn test_unknown_fields_ignored_and_bad_entries_skipped() {
        let value = json!({
            "version": 1,
            "comment": "written by hand",
            "registry": [
                {"id": "good", "speed": 0.5, "cost": 0.5, "quality": 0.5,
                 "capabilities": ["general"], "max_tokens": 1000,
                 "avg_response_ms": 100, "cost_per_token": 0.0, "extra": true},
                {"id": "no-caps", "speed": 0.5, "cost": 0.5, "quality": 0.5,
                 "capabilities": [], "max_tokens": 1000,
                 "avg_response_ms": 100, "cost_per_token": 0.0},
                "garbage"
            ],
            "performance": {
                "good": {"backend_id": "renamed", "total_calls": 3, "success_count": 2},
                "broken": {"total_calls": "many"}
            }
        });

        let snapshot = RouterSnapshot::from_json(value).unwrap();
        assert_eq!(snapshot.registry.len(), 1);
        assert_eq!(snapshot.registry[0].id, "good");
        assert_eq!(snapshot.performance.len(), 1);
        assert_eq!(snapshot.performance["good"].backend_id, "good");
        assert_eq!(snapshot.performance["good"].total_calls, 3);
    }

    #[test]
    fn test_json_round_trip() {
        let mut snapshot = RouterSnapshot::default();
        snapshot.registry.push(CapabilityProfile::new("a"));
        snapshot
            .performance
            .insert("a".to_string(), PerformanceRecord::new("a"));

        let parsed = RouterSnapshot::from_json(snapshot.to_json().unwrap()).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
