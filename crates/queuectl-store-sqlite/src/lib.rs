//! SQLite implementation of the `queuectl` durable job store.
//!
//! This is the reference backend named in the design: a single-machine
//! durable store with atomic compare-and-set semantics, backed by `sqlx`
//! against a SQLite file opened in WAL mode with a short busy timeout so
//! that `compare_and_claim`'s serialized writer contention surfaces as a
//! prompt retry instead of a long stall.
//!
//! SQLite has no `SELECT ... FOR UPDATE SKIP LOCKED`; `compare_and_claim`
//! instead runs a single `UPDATE ... WHERE id = (SELECT ...)` inside a
//! `BEGIN IMMEDIATE` transaction. SQLite's single-writer model serializes
//! that transaction against every other writer, which is sufficient to
//! satisfy the linearizability contract the trait requires without needing
//! row-level locks.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE schema_migrations (version INTEGER NOT NULL);
//!
//! CREATE TABLE jobs (
//!     id             TEXT PRIMARY KEY,
//!     command        TEXT NOT NULL,
//!     state          TEXT NOT NULL,
//!     attempts       INTEGER NOT NULL DEFAULT 0,
//!     max_retries    INTEGER NOT NULL,
//!     created_at     TEXT NOT NULL,
//!     updated_at     TEXT NOT NULL,
//!     locked_by      TEXT,
//!     locked_at      TEXT,
//!     next_retry_at  TEXT,
//!     error          TEXT,
//!     output         TEXT
//! );
//!
//! CREATE INDEX idx_jobs_state ON jobs (state);
//! CREATE INDEX idx_jobs_next_retry_at ON jobs (next_retry_at);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl_core::{DurableStore, Job, JobFilter, JobPatch, JobState, ListOrder, StoreError, StoreResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// The schema version this crate's migrations bring a fresh database to.
/// `open()` fails fast if an existing database reports a different
/// version — a schema mismatch is not something a worker can
/// soft-retry past.
pub const SCHEMA_VERSION: i64 = 1;

/// SQLite-backed `DurableStore`. Cheap to clone: wraps a pooled connection.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the SQLite database at `path`, run
    /// migrations, and verify the schema version. `path` may be `:memory:`
    /// for tests.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let connect_options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        store.check_schema_version().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER NOT NULL)
            "#,
        )
        .execute(&self.pool)
        .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;
        if count == 0 {
            sqlx::query(
                r#"
                CREATE TABLE jobs (
                    id             TEXT PRIMARY KEY,
                    command        TEXT NOT NULL,
                    state          TEXT NOT NULL,
                    attempts       INTEGER NOT NULL DEFAULT 0,
                    max_retries    INTEGER NOT NULL,
                    created_at     TEXT NOT NULL,
                    updated_at     TEXT NOT NULL,
                    locked_by      TEXT,
                    locked_at      TEXT,
                    next_retry_at  TEXT,
                    error          TEXT,
                    output         TEXT
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            sqlx::query("CREATE INDEX idx_jobs_state ON jobs (state)")
                .execute(&self.pool)
                .await?;
            sqlx::query("CREATE INDEX idx_jobs_next_retry_at ON jobs (next_retry_at)")
                .execute(&self.pool)
                .await?;
            sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn check_schema_version(&self) -> anyhow::Result<()> {
        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_migrations LIMIT 1")
            .fetch_one(&self.pool)
            .await?;
        if version != SCHEMA_VERSION {
            anyhow::bail!(
                "durable store schema mismatch: database is at version {version}, this binary expects {SCHEMA_VERSION}"
            );
        }
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

/// SQLite row representation; converts to the core `Job` value type.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    error: Option<String>,
    output: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.id,
            command: self.command,
            state: parse_state(&self.state),
            attempts: self.attempts,
            max_retries: self.max_retries,
            created_at: self.created_at,
            updated_at: self.updated_at,
            locked_by: self.locked_by,
            locked_at: self.locked_at,
            next_retry_at: self.next_retry_at,
            error: self.error,
            output: self.output,
        }
    }
}

fn state_str(state: JobState) -> &'static str {
    match state {
        JobState::Pending => "pending",
        JobState::Processing => "processing",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Dead => "dead",
    }
}

fn parse_state(s: &str) -> JobState {
    match s {
        "pending" => JobState::Pending,
        "processing" => JobState::Processing,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "dead" => JobState::Dead,
        other => {
            warn!(state = other, "unrecognized job state in storage, defaulting to failed");
            JobState::Failed
        }
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert(&self, job: Job) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries,
                created_at, updated_at, locked_by, locked_at,
                next_retry_at, error, output
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(state_str(job.state))
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.locked_by)
        .bind(job.locked_at)
        .bind(job.next_retry_at)
        .bind(&job.error)
        .bind(&job.output)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Err(StoreError::DuplicateId(job.id))
            }
            Err(e) => Err(map_sqlx_error(e)),
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(JobRow::into_job).ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: JobFilter, order: ListOrder, limit: Option<i64>) -> StoreResult<Vec<Job>> {
        let order_sql = match order {
            ListOrder::CreatedAtAsc => "ORDER BY created_at ASC",
            ListOrder::CreatedAtDesc => "ORDER BY created_at DESC",
        };
        let limit = limit.unwrap_or(i64::MAX);

        let rows = if let Some(state) = filter.state {
            sqlx::query_as::<_, JobRow>(&format!(
                "SELECT * FROM jobs WHERE state = ? {order_sql} LIMIT ?"
            ))
            .bind(state_str(state))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, JobRow>(&format!("SELECT * FROM jobs {order_sql} LIMIT ?"))
                .bind(limit)
                .fetch_all(&self.pool)
                .await
        }
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(JobRow::into_job).collect())
    }

    async fn compare_and_claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        // sqlx's `pool.begin()` issues a deferred `BEGIN`, which only takes a
        // write lock when the first write statement runs. Two connections
        // (one per worker process) could then both read the same candidate
        // before either upgrades to a write lock. `BEGIN IMMEDIATE` takes the
        // write lock up front, so the second claimer blocks here rather than
        // racing past the SELECT.
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.map_err(map_sqlx_error)?;

        let candidate: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE state IN ('pending', 'failed')
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
              AND (locked_by IS NULL OR locked_at < ?)
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

        let Some(id) = candidate else {
            sqlx::query("COMMIT").execute(&mut *conn).await.map_err(map_sqlx_error)?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing', locked_by = ?, locked_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(&id)
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::query("COMMIT").execute(&mut *conn).await.map_err(map_sqlx_error)?;
        Ok(Some(row.into_job()))
    }

    async fn conditional_update(
        &self,
        id: &str,
        expected_locked_by: Option<&str>,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let current_locked_by: Option<Option<String>> =
            sqlx::query_scalar("SELECT locked_by FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

        let Some(current_locked_by) = current_locked_by else {
            return Ok(false);
        };
        if current_locked_by.as_deref() != expected_locked_by {
            return Ok(false);
        }

        if let Some(state) = patch.state {
            sqlx::query("UPDATE jobs SET state = ? WHERE id = ?")
                .bind(state_str(state))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        if let Some(attempts) = patch.attempts {
            sqlx::query("UPDATE jobs SET attempts = ? WHERE id = ?")
                .bind(attempts)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        if patch.clear_lock {
            sqlx::query("UPDATE jobs SET locked_by = NULL, locked_at = NULL WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            sqlx::query("UPDATE jobs SET next_retry_at = ? WHERE id = ?")
                .bind(next_retry_at)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        if let Some(error) = patch.error {
            sqlx::query("UPDATE jobs SET error = ? WHERE id = ?")
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        if let Some(output) = patch.output {
            sqlx::query("UPDATE jobs SET output = ? WHERE id = ?")
                .bind(output)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(true)
    }

    async fn list_dlq(&self) -> StoreResult<Vec<Job>> {
        self.list(JobFilter { state: Some(JobState::Dead) }, ListOrder::CreatedAtDesc, None)
            .await
    }

    async fn reset_for_retry(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        match state.as_deref() {
            None => return Err(StoreError::NotFound(id.to_string())),
            Some("dead") => {}
            Some(_) => return Err(StoreError::NotInDlq(id.to_string())),
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, locked_by = NULL, locked_at = NULL,
                next_retry_at = NULL, error = NULL, output = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(row.into_job())
    }

    async fn reap_stale(&self, stale_cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE state = 'processing' AND locked_at < ?",
        )
        .bind(stale_cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        for id in &ids {
            sqlx::query(
                r#"
                UPDATE jobs
                SET state = 'failed', next_retry_at = ?, error = 'stale lock reclaimed',
                    locked_by = NULL, locked_at = NULL, updated_at = ?
                WHERE id = ? AND state = 'processing' AND locked_at < ?
                "#,
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(stale_cutoff)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn memory_store() -> SqliteStore {
        SqliteStore::open(":memory:").await.unwrap()
    }

    fn job(id: &str) -> Job {
        Job::new(id.to_string(), "echo hi".to_string(), 3, Utc::now())
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = memory_store().await;
        store.insert(job("a")).await.unwrap();
        let got = store.get("a").await.unwrap();
        assert_eq!(got.id, "a");
        assert_eq!(got.state, JobState::Pending);
    }

    #[tokio::test]
    async fn insert_duplicate_id_rejected() {
        let store = memory_store().await;
        store.insert(job("a")).await.unwrap();
        let err = store.insert(job("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "a"));
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = memory_store().await;
        assert!(matches!(store.get("nope").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn claim_transitions_to_processing_and_sets_lock() {
        let store = memory_store().await;
        store.insert(job("a")).await.unwrap();
        let now = Utc::now();
        let claimed = store.compare_and_claim("worker-1", now, now).await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Processing);
        assert_eq!(claimed.locked_by.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn claim_excludes_fresh_locks() {
        let store = memory_store().await;
        store.insert(job("a")).await.unwrap();
        let now = Utc::now();
        store.compare_and_claim("worker-1", now, now - chrono::Duration::seconds(60)).await.unwrap();

        let second = store
            .compare_and_claim("worker-2", now, now - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn conditional_update_applies_patch_and_rejects_wrong_lock() {
        let store = memory_store().await;
        store.insert(job("a")).await.unwrap();
        let now = Utc::now();
        store.compare_and_claim("worker-1", now, now).await.unwrap();

        let rejected = store
            .conditional_update("a", Some("worker-2"), JobPatch::to_state(JobState::Completed), now)
            .await
            .unwrap();
        assert!(!rejected);

        let applied = store
            .conditional_update("a", Some("worker-1"), JobPatch::to_state(JobState::Completed), now)
            .await
            .unwrap();
        assert!(applied);

        let job = store.get("a").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn reap_stale_only_reclaims_old_locks() {
        let store = memory_store().await;
        store.insert(job("a")).await.unwrap();
        let claimed_at = Utc::now() - chrono::Duration::seconds(120);
        store.compare_and_claim("worker-1", claimed_at, claimed_at).await.unwrap();

        let now = Utc::now();
        let stale_cutoff = now - chrono::Duration::seconds(60);
        let reaped = store.reap_stale(stale_cutoff, now).await.unwrap();
        assert_eq!(reaped, vec!["a".to_string()]);

        let job = store.get("a").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.locked_by.is_none());
        assert_eq!(job.next_retry_at, Some(now));
    }

    #[tokio::test]
    async fn dlq_round_trip() {
        let store = memory_store().await;
        let mut dead = job("a");
        dead.state = JobState::Dead;
        dead.attempts = 4;
        store.insert(dead).await.unwrap();

        let dlq = store.list_dlq().await.unwrap();
        assert_eq!(dlq.len(), 1);

        let reset = store.reset_for_retry("a", Utc::now()).await.unwrap();
        assert_eq!(reset.state, JobState::Pending);
        assert_eq!(reset.attempts, 0);
    }

    #[tokio::test]
    async fn reset_for_retry_on_non_dead_job_is_rejected() {
        let store = memory_store().await;
        store.insert(job("a")).await.unwrap();
        assert!(matches!(
            store.reset_for_retry("a", Utc::now()).await,
            Err(StoreError::NotInDlq(_))
        ));
    }

    #[tokio::test]
    async fn open_persists_across_reopen_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queuectl.db");
        let path_str = path.to_str().unwrap().to_string();

        {
            let store = SqliteStore::open(&path_str).await.unwrap();
            store.insert(job("a")).await.unwrap();
        }

        let store = SqliteStore::open(&path_str).await.unwrap();
        let got = store.get("a").await.unwrap();
        assert_eq!(got.id, "a");
    }

    /// Scaled-down claim-contention check in the style of the pack's
    /// `sqlite_claim_stress`-type test: many concurrent claimers, one
    /// backlog, no double claims and every job ends up completed exactly
    /// once.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_double_claim() {
        const JOBS: usize = 20;
        const WORKERS: usize = 6;

        let dir = tempdir().unwrap();
        let path = dir.path().join("stress.db");
        let store = Arc::new(SqliteStore::open(path.to_str().unwrap()).await.unwrap());

        for i in 0..JOBS {
            store.insert(job(&format!("job-{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..WORKERS {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let worker_id = format!("worker-{w}");
                let mut claimed = Vec::new();
                loop {
                    let now = Utc::now();
                    match store.compare_and_claim(&worker_id, now, now).await.unwrap() {
                        Some(job) => {
                            store
                                .conditional_update(
                                    &job.id,
                                    Some(worker_id.as_str()),
                                    JobPatch::to_state(JobState::Completed),
                                    now,
                                )
                                .await
                                .unwrap();
                            claimed.push(job.id);
                        }
                        None => break,
                    }
                }
                claimed
            }));
        }

        let mut all_claimed = Vec::new();
        for handle in handles {
            all_claimed.extend(handle.await.unwrap());
        }

        all_claimed.sort();
        all_claimed.dedup();
        assert_eq!(all_claimed.len(), JOBS, "every job should be claimed exactly once");

        let completed = store
            .list(JobFilter { state: Some(JobState::Completed) }, ListOrder::CreatedAtAsc, None)
            .await
            .unwrap();
        assert_eq!(completed.len(), JOBS);
    }
}
