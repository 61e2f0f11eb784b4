//! The durable store trait: the storage boundary every backend implements.
//!
//! Backends implement this trait; `queuectl-store-sqlite` is the reference
//! implementation and `queuectl-testing` provides an in-memory one for
//! fast, backend-agnostic tests of `JobManager` and the worker runtime.

use crate::model::{Job, JobFilter, JobPatch, ListOrder};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage-level failures, distinct from `QueueError`: storage faults are a
/// separate kind from validation/not-found, surfaced to the worker as soft
/// errors and to the control plane as a generic unavailable outcome.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job '{0}' already exists")]
    DuplicateId(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("job '{0}' is not in the dead letter queue")]
    NotInDlq(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The five-primitive-plus-DLQ surface every backend must provide. Every
/// mutation is single-row atomic; no multi-row transactions are required of
/// an implementation.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a brand-new row. Fails with `DuplicateId` if `job.id` exists.
    async fn insert(&self, job: Job) -> StoreResult<()>;

    /// Fetch the current row, or `NotFound`.
    async fn get(&self, id: &str) -> StoreResult<Job>;

    /// List rows matching `filter`, in `order`, capped at `limit` (stable order).
    async fn list(&self, filter: JobFilter, order: ListOrder, limit: Option<i64>) -> StoreResult<Vec<Job>>;

    /// The critical primitive: atomically claims at most one row where
    /// `state ∈ {pending, failed}`, eligible by `next_retry_at`, and either
    /// unlocked or stale-locked (`locked_at < stale_cutoff`), ordered by
    /// `created_at ASC`. Returns the claimed row, or `None` if nothing is
    /// eligible.
    async fn compare_and_claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Job>>;

    /// Apply `patch` iff the row's current `locked_by` equals
    /// `expected_locked_by`; otherwise this is a no-op and returns `false`
    /// (the caller's claim was reaped or preempted).
    async fn conditional_update(
        &self,
        id: &str,
        expected_locked_by: Option<&str>,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Rows currently in the `dead` state.
    async fn list_dlq(&self) -> StoreResult<Vec<Job>>;

    /// `dead → pending` reset: clears `attempts`, locks, `next_retry_at`,
    /// `error`, `output`. Fails with `NotInDlq` if the row isn't `dead`, or
    /// `NotFound` if it doesn't exist.
    async fn reset_for_retry(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Job>;

    /// Reap every `processing` row whose lock is older than `stale_cutoff`:
    /// transition to `failed`, `next_retry_at := now` (immediately eligible),
    /// `attempts` unchanged, clearing lock fields. Each row's update is
    /// independently atomic, so concurrent reapers racing the same row can
    /// only ever have one succeed. Returns the ids actually reaped.
    async fn reap_stale(&self, stale_cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<Vec<String>>;
}
