//! The job manager: the sole mutator of job state.
//!
//! `JobManager` holds no in-memory replica across calls — it is a thin,
//! stateless wrapper over a `DurableStore` handle, injected by constructor;
//! no global singleton.

use crate::config::Config;
use crate::error::QueueError;
use crate::model::{Job, JobFilter, JobPatch, JobState, ListOrder, QueueStatus};
use crate::store::{DurableStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Payload for `Enqueue`: `id` and `command` are required, `max_retries`
/// defaults to `Config::default_max_retries` when omitted.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub id: String,
    pub command: String,
    pub max_retries: Option<i64>,
}

pub struct JobManager {
    store: Arc<dyn DurableStore>,
    config: Config,
}

impl JobManager {
    pub fn new(store: Arc<dyn DurableStore>, config: Config) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `backoff(attempts_new) = backoff_base ^ attempts_new` seconds.
    pub fn backoff(&self, attempts_new: i64) -> ChronoDuration {
        let secs = self.config.backoff_base.pow(attempts_new.max(0) as u32);
        ChronoDuration::seconds(secs)
    }

    /// `Enqueue(id, command, max_retries?)` — `pending` insert, rejecting a
    /// duplicate `id`.
    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<Job, QueueError> {
        if req.id.trim().is_empty() {
            return Err(QueueError::EmptyId);
        }
        if req.command.trim().is_empty() {
            return Err(QueueError::EmptyCommand);
        }
        let max_retries = req.max_retries.unwrap_or(self.config.default_max_retries);
        if max_retries < 0 {
            return Err(QueueError::NegativeMaxRetries);
        }

        let now = Utc::now();
        let job = Job::new(req.id.clone(), req.command, max_retries, now);

        self.store.insert(job.clone()).await.map_err(|e| match e {
            StoreError::DuplicateId(id) => QueueError::DuplicateId(id),
            other => storage_fault(other),
        })?;

        info!(job_id = %job.id, max_retries, "job enqueued");
        Ok(job)
    }

    /// `Claim(worker_id)` via `compare_and_claim`: `{pending, failed} → processing`.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let stale_cutoff = now
            - ChronoDuration::from_std(self.config.stale_lock_threshold).unwrap_or_default();

        self.store
            .compare_and_claim(worker_id, now, stale_cutoff)
            .await
            .map_err(storage_fault)
    }

    /// `ReportSuccess(id, stdout)`: `processing → completed`, guarded by
    /// `locked_by`. Returns `Ok(false)` on lock-lost: recovered locally by
    /// the caller, not surfaced as a hard error.
    pub async fn report_success(&self, id: &str, worker_id: &str, output: String) -> Result<bool, QueueError> {
        let now = Utc::now();
        let patch = JobPatch {
            state: Some(JobState::Completed),
            clear_lock: true,
            output: Some(Some(output)),
            ..Default::default()
        };

        let applied = self
            .store
            .conditional_update(id, Some(worker_id), patch, now)
            .await
            .map_err(storage_fault)?;

        if applied {
            info!(job_id = %id, worker_id, "job completed");
        } else {
            warn!(job_id = %id, worker_id, "lock lost before success could be reported");
        }
        Ok(applied)
    }

    /// `ReportFailure(id, stderr)`: `processing → failed` (retry scheduled)
    /// or `processing → dead` (ceiling exceeded), guarded by `locked_by`.
    /// `attempts` is read fresh from the store so the transition decision
    /// uses the committed value, not a caller-held copy.
    pub async fn report_failure(&self, id: &str, worker_id: &str, error: String) -> Result<bool, QueueError> {
        let now = Utc::now();
        let job = self.store.get(id).await.map_err(storage_fault)?;

        if job.locked_by.as_deref() != Some(worker_id) {
            warn!(job_id = %id, worker_id, "lock lost before failure could be reported");
            return Ok(false);
        }

        let attempts_new = job.attempts + 1;
        let patch = if attempts_new <= job.max_retries {
            let next_retry_at = now + self.backoff(attempts_new);
            JobPatch {
                state: Some(JobState::Failed),
                attempts: Some(attempts_new),
                clear_lock: true,
                next_retry_at: Some(Some(next_retry_at)),
                error: Some(Some(error)),
                ..Default::default()
            }
        } else {
            JobPatch {
                state: Some(JobState::Dead),
                attempts: Some(attempts_new),
                clear_lock: true,
                next_retry_at: Some(None),
                error: Some(Some(error)),
                ..Default::default()
            }
        };

        let dead = attempts_new > job.max_retries;
        let applied = self
            .store
            .conditional_update(id, Some(worker_id), patch, now)
            .await
            .map_err(storage_fault)?;

        if applied {
            if dead {
                warn!(job_id = %id, attempts = attempts_new, "job moved to dead letter queue");
            } else {
                info!(job_id = %id, attempts = attempts_new, "job failed, retry scheduled");
            }
        } else {
            warn!(job_id = %id, worker_id, "lock lost before failure could be reported");
        }
        Ok(applied)
    }

    /// Stale-lock reap pass, run opportunistically before each claim.
    pub async fn reap_stale(&self) -> Result<Vec<String>, QueueError> {
        let now = Utc::now();
        let stale_cutoff = now
            - ChronoDuration::from_std(self.config.stale_lock_threshold).unwrap_or_default();

        let reaped = self.store.reap_stale(stale_cutoff, now).await.map_err(storage_fault)?;
        for id in &reaped {
            warn!(job_id = %id, "stale lock reclaimed");
        }
        Ok(reaped)
    }

    /// `Info(id)`.
    pub async fn info(&self, id: &str) -> Result<Job, QueueError> {
        self.store.get(id).await.map_err(|e| match e {
            StoreError::NotFound(id) => QueueError::NotFound(id),
            other => storage_fault(other),
        })
    }

    /// `List(state_filter?)`, ordered `created_at DESC`.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        self.store
            .list(JobFilter { state }, ListOrder::CreatedAtDesc, None)
            .await
            .map_err(storage_fault)
    }

    /// `Status()`: aggregate counts per state.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let jobs = self.list(None).await?;
        let mut status = QueueStatus::default();
        for job in jobs {
            match job.state {
                JobState::Pending => status.pending += 1,
                JobState::Processing => status.processing += 1,
                JobState::Completed => status.completed += 1,
                JobState::Failed => status.failed += 1,
                JobState::Dead => status.dead += 1,
            }
        }
        Ok(status)
    }

    /// `DlqList()`.
    pub async fn dlq_list(&self) -> Result<Vec<Job>, QueueError> {
        self.store.list_dlq().await.map_err(storage_fault)
    }

    /// `DlqRetry(id)`: `dead → pending`.
    pub async fn dlq_retry(&self, id: &str) -> Result<Job, QueueError> {
        let now = Utc::now();
        let job = self.store.reset_for_retry(id, now).await.map_err(|e| match e {
            StoreError::NotFound(id) => QueueError::NotFound(id),
            StoreError::NotInDlq(id) => QueueError::NotInDlq(id),
            other => storage_fault(other),
        })?;
        info!(job_id = %job.id, "job rescheduled from dead letter queue");
        Ok(job)
    }
}

fn storage_fault(err: StoreError) -> QueueError {
    match err {
        StoreError::DuplicateId(id) => QueueError::DuplicateId(id),
        StoreError::NotFound(id) => QueueError::NotFound(id),
        StoreError::NotInDlq(id) => QueueError::NotInDlq(id),
        StoreError::Backend(e) => QueueError::StorageUnavailable(e),
    }
}

/// True once `now` reaches `deadline` — used by callers deciding claim
/// eligibility when composing tests against fixed clocks.
pub fn is_due(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match deadline {
        None => true,
        Some(d) => d <= now,
    }
}
