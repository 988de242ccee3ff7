//! Embedded libSQL storage for TrendRadar.
//!
//! The [`Storage`] struct wraps a local libSQL database holding run records,
//! the collected-item history used for the lookback merge, and the
//! completion cache.
//!
//! **Access rules:**
//! - `trendradar run`: read-write via [`Storage::open`]
//! - `trendradar runs list`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};

use trendradar_shared::{ItemMetadata, RawItem, Result, RunId, TrendRadarError};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Stored summary of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `running`, `completed`, `degraded`, `aborted` or `cancelled`.
    pub status: String,
    pub item_count: u64,
    pub topic_count: u64,
    pub report_path: Option<String>,
    pub error: Option<String>,
}

/// Final figures written when a run ends.
#[derive(Debug, Clone, Default)]
pub struct RunSummary<'a> {
    pub status: &'a str,
    pub item_count: usize,
    pub topic_count: usize,
    pub report_path: Option<&'a str>,
    pub error: Option<&'a str>,
}

fn storage_err(e: impl std::fmt::Display) -> TrendRadarError {
    TrendRadarError::Storage(e.to_string())
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TrendRadarError::Storage(format!("invalid date '{s}': {e}")))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrendRadarError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for reading only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TrendRadarError::Storage(format!(
                "no database at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

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
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    TrendRadarError::Storage(format!(
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
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TrendRadarError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(&self, run_id: &RunId, started_at: &DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, status) VALUES (?1, ?2, 'running')
                 ON CONFLICT(id) DO UPDATE SET status = 'running', finished_at = NULL, error = NULL",
                params![run_id.to_string(), timestamp(started_at)],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Record the outcome of a run.
    pub async fn finish_run(&self, run_id: &RunId, summary: &RunSummary<'_>) -> Result<()> {
        self.check_writable()?;
        let now = timestamp(&Utc::now());
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, status = ?2, item_count = ?3, topic_count = ?4,
                        report_path = ?5, error = ?6
                 WHERE id = ?7",
                params![
                    now,
                    summary.status,
                    summary.item_count as i64,
                    summary.topic_count as i64,
                    summary.report_path,
                    summary.error,
                    run_id.to_string()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, status, item_count, topic_count, report_path, error
                 FROM runs ORDER BY started_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_run(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Item history
    // -----------------------------------------------------------------------

    /// Append collected items to the history.
    pub async fn record_items(&self, run_id: &RunId, items: &[RawItem]) -> Result<usize> {
        self.check_writable()?;
        let run = run_id.to_string();
        let tx = self.conn.transaction().await.map_err(storage_err)?;

        for item in items {
            let metadata = item
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(storage_err)?;
            tx.execute(
                "INSERT INTO item_history (run_id, platform, title, rank, url, fetched_at, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.as_str(),
                    item.platform.as_str(),
                    item.title.as_str(),
                    i64::from(item.rank),
                    item.url.as_str(),
                    timestamp(&item.fetched_at),
                    metadata
                ],
            )
            .await
            .map_err(storage_err)?;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(items.len())
    }

    /// Items fetched at or after `cutoff`, oldest first.
    pub async fn items_since(&self, cutoff: &DateTime<Utc>) -> Result<Vec<RawItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT platform, title, rank, url, fetched_at, metadata_json
                 FROM item_history WHERE fetched_at >= ?1 ORDER BY fetched_at, id",
                params![timestamp(cutoff)],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            results.push(row_to_item(&row)?);
        }
        Ok(results)
    }

    /// Delete history older than `cutoff`. Returns the number of rows removed.
    pub async fn prune_history(&self, cutoff: &DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM item_history WHERE fetched_at < ?1",
                params![timestamp(cutoff)],
            )
            .await
            .map_err(storage_err)
    }

    // -----------------------------------------------------------------------
    // Completion cache
    // -----------------------------------------------------------------------

    /// Get a cached completion, if any.
    pub async fn get_llm_cache(
        &self,
        scope: &str,
        prompt_hash: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response FROM llm_cache
                 WHERE scope = ?1 AND prompt_hash = ?2 AND model_id = ?3",
                params![scope, prompt_hash, model_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Store a completion, replacing any previous entry for the same key.
    pub async fn set_llm_cache(
        &self,
        scope: &str,
        prompt_hash: &str,
        model_id: &str,
        response: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = timestamp(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO llm_cache (scope, prompt_hash, model_id, response, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(scope, prompt_hash, model_id) DO UPDATE SET
                   response = excluded.response,
                   created_at = excluded.created_at",
                params![scope, prompt_hash, model_id, response, now],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Drop one cached completion.
    pub async fn remove_llm_cache(
        &self,
        scope: &str,
        prompt_hash: &str,
        model_id: &str,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM llm_cache
                 WHERE scope = ?1 AND prompt_hash = ?2 AND model_id = ?3",
                params![scope, prompt_hash, model_id],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Drop every cached completion for `scope`, or all of them. Returns the
    /// number of entries removed.
    pub async fn invalidate_llm_cache(&self, scope: Option<&str>) -> Result<u64> {
        self.check_writable()?;
        let removed = match scope {
            Some(scope) => self
                .conn
                .execute("DELETE FROM llm_cache WHERE scope = ?1", params![scope])
                .await,
            None => self.conn.execute("DELETE FROM llm_cache", params![]).await,
        };
        removed.map_err(storage_err)
    }
}

fn row_to_run(row: &libsql::Row) -> Result<RunRecord> {
    let started: String = row.get(1).map_err(storage_err)?;
    let finished = row.get::<String>(2).ok();
    Ok(RunRecord {
        id: row.get::<String>(0).map_err(storage_err)?,
        started_at: parse_timestamp(&started)?,
        finished_at: finished.as_deref().map(parse_timestamp).transpose()?,
        status: row.get::<String>(3).map_err(storage_err)?,
        item_count: row.get::<i64>(4).map_err(storage_err)?.max(0) as u64,
        topic_count: row.get::<i64>(5).map_err(storage_err)?.max(0) as u64,
        report_path: row.get::<String>(6).ok(),
        error: row.get::<String>(7).ok(),
    })
}

fn row_to_item(row: &libsql::Row) -> Result<RawItem> {
    let fetched: String = row.get(4).map_err(storage_err)?;
    let metadata = match row.get::<String>(5).ok() {
        Some(json) => Some(serde_json::from_str::<ItemMetadata>(&json).map_err(storage_err)?),
        None => None,
    };
    Ok(RawItem {
        platform: row.get::<String>(0).map_err(storage_err)?,
        title: row.get::<String>(1).map_err(storage_err)?,
        rank: row.get::<u32>(2).map_err(storage_err)?,
        url: row.get::<String>(3).map_err(storage_err)?,
        fetched_at: parse_timestamp(&fetched)?,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("tr_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn item(platform: &str, title: &str, fetched_at: DateTime<Utc>) -> RawItem {
        RawItem {
            platform: platform.into(),
            title: title.into(),
            rank: 3,
            url: "https://example.com".into(),
            fetched_at,
            metadata: Some(ItemMetadata {
                platform_name: Some("Weibo".into()),
                mobile_url: None,
                hot_value: Some(42.0),
            }),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("tr_test_{}.db", Uuid::now_v7()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let storage = test_storage().await;
        let run_id = RunId::new();
        storage
            .insert_run(&run_id, &Utc::now())
            .await
            .expect("insert run");

        let runs = storage.list_runs(10).await.expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, "running");
        assert!(runs[0].finished_at.is_none());

        storage
            .finish_run(
                &run_id,
                &RunSummary {
                    status: "degraded",
                    item_count: 120,
                    topic_count: 8,
                    report_path: Some("/tmp/report.html"),
                    error: None,
                },
            )
            .await
            .expect("finish run");

        let runs = storage.list_runs(10).await.expect("list");
        assert_eq!(runs[0].id, run_id.to_string());
        assert_eq!(runs[0].status, "degraded");
        assert_eq!(runs[0].item_count, 120);
        assert_eq!(runs[0].report_path.as_deref(), Some("/tmp/report.html"));
        assert!(runs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn history_window_and_prune() {
        let storage = test_storage().await;
        let run_id = RunId::new();
        let now = Utc::now();
        let old = now - Duration::hours(30);
        let recent = now - Duration::hours(2);

        storage
            .record_items(
                &run_id,
                &[item("weibo", "old", old), item("weibo", "recent", recent)],
            )
            .await
            .expect("record");

        let since = storage
            .items_since(&(now - Duration::hours(24)))
            .await
            .expect("query");
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].title, "recent");
        assert_eq!(since[0].rank, 3);
        assert_eq!(since[0].hot_value(), Some(42.0));

        let removed = storage
            .prune_history(&(now - Duration::hours(24)))
            .await
            .expect("prune");
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn llm_cache_roundtrip() {
        let storage = test_storage().await;

        let miss = storage
            .get_llm_cache("analysis", "hash1", "moonshot-v1-8k")
            .await
            .expect("miss");
        assert!(miss.is_none());

        storage
            .set_llm_cache("analysis", "hash1", "moonshot-v1-8k", "first")
            .await
            .expect("set");
        storage
            .set_llm_cache("analysis", "hash1", "moonshot-v1-8k", "second")
            .await
            .expect("overwrite");

        let hit = storage
            .get_llm_cache("analysis", "hash1", "moonshot-v1-8k")
            .await
            .expect("hit");
        assert_eq!(hit.as_deref(), Some("second"));

        // Different model, different key.
        assert!(
            storage
                .get_llm_cache("analysis", "hash1", "other-model")
                .await
                .expect("other")
                .is_none()
        );

        storage
            .remove_llm_cache("analysis", "hash1", "moonshot-v1-8k")
            .await
            .expect("remove");
        assert!(
            storage
                .get_llm_cache("analysis", "hash1", "moonshot-v1-8k")
                .await
                .expect("after remove")
                .is_none()
        );
    }

    #[tokio::test]
    async fn invalidate_by_scope_or_everything() {
        let storage = test_storage().await;
        for (scope, hash) in [("a", "h1"), ("a", "h2"), ("b", "h1")] {
            storage
                .set_llm_cache(scope, hash, "m", "text")
                .await
                .expect("set");
        }

        let removed = storage.invalidate_llm_cache(Some("a")).await.expect("scope");
        assert_eq!(removed, 2);
        assert!(storage.get_llm_cache("b", "h1", "m").await.expect("b").is_some());

        let removed = storage.invalidate_llm_cache(None).await.expect("all");
        assert_eq!(removed, 1);
        assert!(storage.get_llm_cache("b", "h1", "m").await.expect("b").is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("tr_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.expect("create"));
        let ro = Storage::open_readonly(&tmp).await.expect("open ro");
        assert!(ro.insert_run(&RunId::new(), &Utc::now()).await.is_err());
        assert!(ro.list_runs(5).await.expect("read").is_empty());
    }
}
