//! In-memory `DurableStore` and job fixtures for testing `queuectl-core` and
//! `queuectl-worker` without a real SQLite file.
//!
//! A backend-agnostic fake that the rest of the workspace depends on only
//! under `[dev-dependencies]`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl_core::{
    is_due, DurableStore, Job, JobFilter, JobPatch, JobState, ListOrder, StoreError, StoreResult,
};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A `tokio::sync::Mutex<HashMap<String, Job>>`-backed store. Claims and
/// conditional updates are serialized through the single mutex, so claims
/// stay linearizable just like a real backend, just without persistence
/// across process restarts.
#[derive(Default)]
pub struct InMemoryStore {
    rows: Mutex<HashMap<String, Job>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot every row, for assertions that want the whole table.
    pub async fn snapshot(&self) -> Vec<Job> {
        self.rows.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert(&self, job: Job) -> StoreResult<()> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        rows.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Job> {
        self.rows
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: JobFilter, order: ListOrder, limit: Option<i64>) -> StoreResult<Vec<Job>> {
        let rows = self.rows.lock().await;
        let mut jobs: Vec<Job> = rows
            .values()
            .filter(|j| filter.state.is_none_or(|s| j.state == s))
            .cloned()
            .collect();
        match order {
            ListOrder::CreatedAtAsc => jobs.sort_by_key(|j| j.created_at),
            ListOrder::CreatedAtDesc => jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at)),
        }
        if let Some(limit) = limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }

    async fn compare_and_claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let mut rows = self.rows.lock().await;
        let mut candidates: Vec<&mut Job> = rows
            .values_mut()
            .filter(|j| {
                matches!(j.state, JobState::Pending | JobState::Failed)
                    && is_due(j.next_retry_at, now)
                    && (j.locked_by.is_none() || j.locked_at.is_some_and(|l| l < stale_cutoff))
            })
            .collect();
        candidates.sort_by_key(|j| j.created_at);
        if let Some(job) = candidates.into_iter().next() {
            job.state = JobState::Processing;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.updated_at = now;
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn conditional_update(
        &self,
        id: &str,
        expected_locked_by: Option<&str>,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut rows = self.rows.lock().await;
        let Some(job) = rows.get_mut(id) else {
            return Ok(false);
        };
        if job.locked_by.as_deref() != expected_locked_by {
            return Ok(false);
        }
        if let Some(state) = patch.state {
            job.state = state;
        }
        if let Some(attempts) = patch.attempts {
            job.attempts = attempts;
        }
        if patch.clear_lock {
            job.locked_by = None;
            job.locked_at = None;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            job.next_retry_at = next_retry_at;
        }
        if let Some(error) = patch.error {
            job.error = error;
        }
        if let Some(output) = patch.output {
            job.output = output;
        }
        job.updated_at = now;
        Ok(true)
    }

    async fn list_dlq(&self) -> StoreResult<Vec<Job>> {
        self.list(JobFilter { state: Some(JobState::Dead) }, ListOrder::CreatedAtDesc, None)
            .await
    }

    async fn reset_for_retry(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Job> {
        let mut rows = self.rows.lock().await;
        let job = rows.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if job.state != JobState::Dead {
            return Err(StoreError::NotInDlq(id.to_string()));
        }
        job.state = JobState::Pending;
        job.attempts = 0;
        job.locked_by = None;
        job.locked_at = None;
        job.next_retry_at = None;
        job.error = None;
        job.output = None;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn reap_stale(&self, stale_cutoff: DateTime<Utc>, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let mut rows = self.rows.lock().await;
        let mut reaped = Vec::new();
        for job in rows.values_mut() {
            if job.state == JobState::Processing && job.locked_at.is_some_and(|l| l < stale_cutoff) {
                job.state = JobState::Failed;
                job.next_retry_at = Some(now);
                job.error = Some("stale lock reclaimed".to_string());
                job.locked_by = None;
                job.locked_at = None;
                job.updated_at = now;
                reaped.push(job.id.clone());
            }
        }
        Ok(reaped)
    }
}

/// Builder for test `Job` fixtures, so scenario tests don't repeat the
/// `Job` struct literal every time they need a job in a specific state.
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            job: Job::new(id.into(), command.into(), 3, Utc::now()),
        }
    }

    pub fn max_retries(mut self, max_retries: i64) -> Self {
        self.job.max_retries = max_retries;
        self
    }

    pub fn attempts(mut self, attempts: i64) -> Self {
        self.job.attempts = attempts;
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.job.state = state;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.job.created_at = created_at;
        self
    }

    pub fn locked_by(mut self, worker_id: impl Into<String>, locked_at: DateTime<Utc>) -> Self {
        self.job.locked_by = Some(worker_id.into());
        self.job.locked_at = Some(locked_at);
        self
    }

    pub fn next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.next_retry_at = Some(at);
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use queuectl_core::JobPatch;

    #[tokio::test]
    async fn claim_is_exclusive_across_concurrent_callers() {
        let store = InMemoryStore::new();
        store.insert(JobBuilder::new("a", "echo hi").build()).await.unwrap();

        let now = Utc::now();
        let cutoff = now - Duration::seconds(60);
        let a = store.compare_and_claim("w1", now, cutoff).await.unwrap();
        let b = store.compare_and_claim("w2", now, cutoff).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_none());
    }

    #[tokio::test]
    async fn conditional_update_rejects_mismatched_lock() {
        let store = InMemoryStore::new();
        store.insert(JobBuilder::new("a", "echo hi").build()).await.unwrap();
        let now = Utc::now();
        store.compare_and_claim("w1", now, now).await.unwrap();

        let applied = store
            .conditional_update("a", Some("w2"), JobPatch::to_state(JobState::Completed), now)
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn builder_produces_requested_state() {
        let job = JobBuilder::new("a", "echo hi")
            .state(JobState::Dead)
            .attempts(4)
            .max_retries(3)
            .build();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 4);
    }
}
