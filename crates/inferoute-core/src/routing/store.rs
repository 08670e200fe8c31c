//! Persistent storage for router snapshots
//!
//! SQLite-backed history of exported router state, so learned statistics
//! survive process restarts.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::snapshot::RouterSnapshot;
use crate::error::{Error, Result};

/// SQL to create the snapshot table
pub const CREATE_SNAPSHOTS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS router_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL,
    version INTEGER NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_router_snapshots_created ON router_snapshots(created_at);
"#;

/// Metadata of one stored snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub version: u32,
    /// Payload size in bytes
    pub size: usize,
}

/// Store for persisting router snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Create a new store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new store and connect to the database
    pub async fn connect(database_path: &Path) -> Result<Self> {
        if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite://{}?mode=rwc", database_path.display());

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(Error::DatabaseError)?;

        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_SNAPSHOTS_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        info!("Router snapshot table initialized");
        Ok(())
    }

    /// Save a snapshot; returns its row id
    pub async fn save(&self, snapshot: &RouterSnapshot) -> Result<i64> {
        let payload = serde_json::to_string(snapshot)?;

        let result = sqlx::query(
            "INSERT INTO router_snapshots (created_at, version, payload) VALUES (?, ?, ?)",
        )
        .bind(snapshot.exported_at.to_rfc3339())
        .bind(snapshot.version as i64)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let id = result.last_insert_rowid();
        debug!(id, bytes = payload.len(), "Saved router snapshot");
        Ok(id)
    }

    /// Load the most recently saved snapshot
    pub async fn load_latest(&self) -> Result<Option<RouterSnapshot>> {
        let row = sqlx::query("SELECT payload FROM router_snapshots ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.get("payload");
        let value: serde_json::Value = serde_json::from_str(&payload)?;
        RouterSnapshot::from_json(value).map(Some)
    }

    /// Stored snapshots, newest first
    pub async fn list(&self) -> Result<Vec<StoredSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id, created_at, version, LENGTH(payload) AS size
            FROM router_snapshots
            ORDER BY id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let snapshots = rows
            .into_iter()
            .map(|row| {
                let created_at: String = row.get("created_at");
                StoredSnapshot {
                    id: row.get("id"),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_default(),
                    version: row.get::<i64, _>("version") as u32,
                    size: row.get::<i64, _>("size") as usize,
                }
            })
            .collect();

        Ok(snapshots)
    }

    /// Keep only the newest `keep` snapshots; returns how many were deleted
    pub async fn prune(&self, keep: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM router_snapshots
            WHERE id NOT IN (SELECT id FROM router_snapshots ORDER BY id DESC LIMIT ?)
            "#,
        )
        .bind(keep as i64)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let deleted = result.rows_affected();
        debug!(keep, deleted, "Pruned router snapshots");
        Ok(deleted)
    }

    /// Delete every snapshot
    pub async fn clear_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM router_snapshots")
            .execute(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;

        let deleted = result.rows_affected();
        warn!(deleted = deleted, "Cleared all router snapshots");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::ledger::PerformanceRecord;
    use crate::routing::types::CapabilityProfile;
    use tempfile::{TempDir, tempdir};

    async fn create_test_store() -> (SnapshotStore, TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("state").join("test_snapshots.db");

        let store = SnapshotStore::connect(&db_path).await.unwrap();
        store.init().await.unwrap();

        // Return the dir to keep it alive for the test duration
        (store, dir)
    }

    fn snapshot(backend: &str) -> RouterSnapshot {
        let mut snapshot = RouterSnapshot::default();
        snapshot.registry.push(CapabilityProfile::new(backend));
        let mut record = PerformanceRecord::new(backend);
        record.total_calls = 4;
        record.success_count = 3;
        snapshot.performance.insert(backend.to_string(), record);
        snapshot
    }

    #[tokio::test]
    async fn test_empty_store_has_no_latest() {
        let (store, _temp) = create_test_store().await;
        assert!(store.load_latest().await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let (store, _temp) = create_test_store().await;

        store.save(&snapshot("first")).await.unwrap();
        let second = snapshot("second");
        store.save(&second).await.unwrap();

        let loaded = store.load_latest().await.unwrap().unwrap();
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn test_list_and_prune() {
        let (store, _temp) = create_test_store().await;
        for name in ["a", "b", "c", "d"] {
            store.save(&snapshot(name)).await.unwrap();
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 4);
        assert!(listed[0].id > listed[3].id);
        assert!(listed.iter().all(|s| s.size > 0));

        assert_eq!(store.prune(2).await.unwrap(), 2);
        let remaining = store.list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, listed[0].id);

        let latest = store.load_latest().await.unwrap().unwrap();
        assert!(latest.performance.contains_key("d"));
    }

    #[tokio::test]
    async fn test_clear_all() {
        let (store, _temp) = create_test_store().await;
        store.save(&snapshot("a")).await.unwrap();
        store.save(&snapshot("b")).await.unwrap();

        assert_eq!(store.clear_all().await.unwrap(), 2);
        assert!(store.load_latest().await.unwrap().is_none());
    }
}
