//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding memoized operation
//! results (the persistent half of the cache store) and the batch-run history.
//!
//! **Access rules:**
//! - `run` and `cache purge|clear`: read-write via [`Storage::open`]
//! - `cache stats`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use bookmarks_shared::{BatchRun, BookmarkError, Result, RunId};
use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};

/// One memoized operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Hex digest of the operation name and its canonical inputs.
    pub key: String,
    /// Operation class name (e.g., `liveness.fetch`).
    pub operation: String,
    /// Serialized result.
    pub value_json: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Entry counts for one operation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub operation: String,
    pub live: u64,
    pub expired: u64,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BookmarkError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BookmarkError::Storage(format!(
                "cache database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        BookmarkError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BookmarkError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cache entries
    // -----------------------------------------------------------------------

    /// Get the entry for `key` if it has not expired at `now`.
    pub async fn get_cache_entry(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, operation, value_json, created_at, expires_at
                 FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now.timestamp_millis()],
            )
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_cache_entry(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(BookmarkError::Storage(e.to_string())),
        }
    }

    /// Store an entry (last write wins on the same key).
    pub async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO cache_entries (key, operation, value_json, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO UPDATE SET
                   operation = excluded.operation,
                   value_json = excluded.value_json,
                   created_at = excluded.created_at,
                   expires_at = excluded.expires_at",
                params![
                    entry.key.as_str(),
                    entry.operation.as_str(),
                    entry.value_json.as_str(),
                    entry.created_at.timestamp_millis(),
                    entry.expires_at.timestamp_millis()
                ],
            )
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Delete one entry. Returns whether it existed.
    pub async fn delete_cache_entry(&self, key: &str) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute("DELETE FROM cache_entries WHERE key = ?1", params![key])
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    /// Delete every entry expired at `now`. Returns the number removed.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![now.timestamp_millis()],
            )
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))
    }

    /// Delete all entries, or only those of one operation class.
    pub async fn clear_cache(&self, operation: Option<&str>) -> Result<u64> {
        self.check_writable()?;
        let result = match operation {
            Some(op) => {
                self.conn
                    .execute(
                        "DELETE FROM cache_entries WHERE operation = ?1",
                        params![op],
                    )
                    .await
            }
            None => {
                self.conn
                    .execute("DELETE FROM cache_entries", params![])
                    .await
            }
        };
        result.map_err(|e| BookmarkError::Storage(e.to_string()))
    }

    /// Live and expired entry counts per operation class.
    pub async fn cache_stats(&self, now: DateTime<Utc>) -> Result<Vec<CacheStats>> {
        let mut rows = self
            .conn
            .query(
                "SELECT operation,
                        SUM(CASE WHEN expires_at > ?1 THEN 1 ELSE 0 END),
                        SUM(CASE WHEN expires_at > ?1 THEN 0 ELSE 1 END)
                 FROM cache_entries GROUP BY operation ORDER BY operation",
                params![now.timestamp_millis()],
            )
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(CacheStats {
                operation: row
                    .get::<String>(0)
                    .map_err(|e| BookmarkError::Storage(e.to_string()))?,
                live: row
                    .get::<i64>(1)
                    .map_err(|e| BookmarkError::Storage(e.to_string()))?
                    .max(0) as u64,
                expired: row
                    .get::<i64>(2)
                    .map_err(|e| BookmarkError::Storage(e.to_string()))?
                    .max(0) as u64,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Batch runs
    // -----------------------------------------------------------------------

    /// Record the start of a batch run. Returns its ID.
    pub async fn insert_batch_run(&self, input_path: &str) -> Result<RunId> {
        self.check_writable()?;
        let id = RunId::new();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO batch_runs (id, input_path, started_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), input_path, now.as_str()],
            )
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Mark a batch run as finished with its stats.
    pub async fn finish_batch_run(&self, id: &RunId, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE batch_runs SET finished_at = ?1, stats_json = ?2 WHERE id = ?3",
                params![now.as_str(), stats_json, id.to_string()],
            )
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Most recent batch runs, newest first.
    pub async fn list_batch_runs(&self, limit: u32) -> Result<Vec<BatchRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, input_path, started_at, finished_at, stats_json
                 FROM batch_runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| BookmarkError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_batch_run(&row)?);
        }
        Ok(results)
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| BookmarkError::Storage(format!("invalid timestamp: {ms}")))
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BookmarkError::Storage(format!("invalid date: {e}")))
}

/// Convert a libSQL row to [`CacheEntry`].
fn row_to_cache_entry(row: &libsql::Row) -> Result<CacheEntry> {
    Ok(CacheEntry {
        key: row
            .get::<String>(0)
            .map_err(|e| BookmarkError::Storage(e.to_string()))?,
        operation: row
            .get::<String>(1)
            .map_err(|e| BookmarkError::Storage(e.to_string()))?,
        value_json: row
            .get::<String>(2)
            .map_err(|e| BookmarkError::Storage(e.to_string()))?,
        created_at: millis_to_datetime(
            row.get::<i64>(3)
                .map_err(|e| BookmarkError::Storage(e.to_string()))?,
        )?,
        expires_at: millis_to_datetime(
            row.get::<i64>(4)
                .map_err(|e| BookmarkError::Storage(e.to_string()))?,
        )?,
    })
}

/// Convert a libSQL row to [`BatchRun`].
fn row_to_batch_run(row: &libsql::Row) -> Result<BatchRun> {
    let id: String = row
        .get(0)
        .map_err(|e| BookmarkError::Storage(e.to_string()))?;
    let started_at: String = row
        .get(2)
        .map_err(|e| BookmarkError::Storage(e.to_string()))?;

    Ok(BatchRun {
        id: id
            .parse()
            .map_err(|e| BookmarkError::Storage(format!("invalid run id: {e}")))?,
        input_path: row
            .get::<String>(1)
            .map_err(|e| BookmarkError::Storage(e.to_string()))?,
        started_at: parse_rfc3339(&started_at)?,
        finished_at: row
            .get::<String>(3)
            .ok()
            .map(|s| parse_rfc3339(&s))
            .transpose()?,
        stats: row
            .get::<String>(4)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    /// In-memory storage for tests that do not reopen the database.
    async fn test_storage() -> Storage {
        Storage::open(Path::new(":memory:")).await.expect("open test db")
    }

    fn scratch_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("bm_test_{}", Uuid::now_v7()))
    }

    fn entry(key: &str, operation: &str, now: DateTime<Utc>, ttl: Duration) -> CacheEntry {
        CacheEntry {
            key: key.into(),
            operation: operation.into(),
            value_json: format!(r#"{{"key":"{key}"}}"#),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let dir = scratch_dir();
        let tmp = dir.join("cache.db");
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
        drop(s2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn cache_entry_miss_put_hit() {
        let storage = test_storage().await;
        let now = Utc::now();

        let cached = storage.get_cache_entry("k1", now).await.expect("get miss");
        assert!(cached.is_none());

        let e = entry("k1", "liveness.probe", now, Duration::days(7));
        storage.put_cache_entry(&e).await.expect("put");

        let cached = storage
            .get_cache_entry("k1", now)
            .await
            .expect("get hit")
            .expect("entry present");
        assert_eq!(cached.operation, "liveness.probe");
        assert_eq!(cached.value_json, e.value_json);
        assert_eq!(
            cached.expires_at.timestamp_millis(),
            e.expires_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn expired_entry_is_absent() {
        let storage = test_storage().await;
        let now = Utc::now();
        storage
            .put_cache_entry(&entry("old", "llm.summarize", now, Duration::seconds(1)))
            .await
            .unwrap();

        let later = now + Duration::seconds(2);
        assert!(storage.get_cache_entry("old", later).await.unwrap().is_none());
        assert!(storage.get_cache_entry("old", now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn put_is_last_write_wins() {
        let storage = test_storage().await;
        let now = Utc::now();
        let mut e = entry("k", "liveness.fetch", now, Duration::days(1));
        storage.put_cache_entry(&e).await.unwrap();
        e.value_json = r#"{"v":2}"#.into();
        storage.put_cache_entry(&e).await.unwrap();

        let cached = storage.get_cache_entry("k", now).await.unwrap().unwrap();
        assert_eq!(cached.value_json, r#"{"v":2}"#);
    }

    #[tokio::test]
    async fn purge_stats_and_clear() {
        let storage = test_storage().await;
        let now = Utc::now();
        storage
            .put_cache_entry(&entry("a", "liveness.probe", now, Duration::days(7)))
            .await
            .unwrap();
        storage
            .put_cache_entry(&entry("b", "liveness.probe", now, Duration::seconds(-1)))
            .await
            .unwrap();
        storage
            .put_cache_entry(&entry("c", "llm.suggest_tags", now, Duration::days(7)))
            .await
            .unwrap();

        let stats = storage.cache_stats(now).await.expect("stats");
        assert_eq!(
            stats,
            vec![
                CacheStats {
                    operation: "liveness.probe".into(),
                    live: 1,
                    expired: 1
                },
                CacheStats {
                    operation: "llm.suggest_tags".into(),
                    live: 1,
                    expired: 0
                },
            ]
        );

        assert_eq!(storage.purge_expired(now).await.expect("purge"), 1);
        assert_eq!(
            storage.clear_cache(Some("llm.suggest_tags")).await.expect("clear op"),
            1
        );
        assert!(storage.get_cache_entry("a", now).await.unwrap().is_some());
        assert_eq!(storage.clear_cache(None).await.expect("clear all"), 1);
        assert!(storage.cache_stats(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_entry() {
        let storage = test_storage().await;
        let now = Utc::now();
        storage
            .put_cache_entry(&entry("d", "content.extract", now, Duration::days(7)))
            .await
            .unwrap();
        assert!(storage.delete_cache_entry("d").await.unwrap());
        assert!(!storage.delete_cache_entry("d").await.unwrap());
    }

    #[tokio::test]
    async fn batch_run_lifecycle() {
        let storage = test_storage().await;

        let run_id = storage
            .insert_batch_run("bookmarks.json")
            .await
            .expect("insert batch run");

        storage
            .finish_batch_run(&run_id, r#"{"processed": 10, "failed": 1}"#)
            .await
            .expect("finish batch run");

        let runs = storage.list_batch_runs(10).await.expect("list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run_id);
        assert_eq!(runs[0].input_path, "bookmarks.json");
        assert!(runs[0].finished_at.is_some());
        assert_eq!(runs[0].stats.as_ref().unwrap()["processed"], 10);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let dir = scratch_dir();
        let tmp = dir.join("cache.db");
        let rw = Storage::open(&tmp).await.unwrap();
        rw.put_cache_entry(&entry("k", "liveness.probe", Utc::now(), Duration::days(1)))
            .await
            .unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.cache_stats(Utc::now()).await.unwrap().len(), 1);
        let result = ro.clear_cache(None).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));

        drop(ro);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("bm_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
