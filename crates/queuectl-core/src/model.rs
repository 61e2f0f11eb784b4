//! The `Job` entity and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The five states a job can occupy. `Completed` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A persisted job row. The durable store is the sole owner; `JobManager`
/// never holds an in-memory replica across calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output: Option<String>,
}

impl Job {
    /// Build a freshly-enqueued job in `pending` state, with no lock and no
    /// prior attempts.
    pub fn new(id: String, command: String, max_retries: i64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            locked_by: None,
            locked_at: None,
            next_retry_at: None,
            error: None,
            output: None,
        }
    }

    /// `locked_by`/`locked_at` are always both null or both set, and being
    /// locked implies `state == Processing`.
    pub fn locked(&self) -> bool {
        self.locked_by.is_some()
    }
}

/// A partial update applied by `DurableStore::conditional_update`. Only the
/// fields set to `Some` are written; this keeps every transition an explicit,
/// narrow patch instead of a full-row overwrite.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub attempts: Option<i64>,
    pub clear_lock: bool,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub error: Option<Option<String>>,
    pub output: Option<Option<String>>,
}

impl JobPatch {
    pub fn to_state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Default::default()
        }
    }
}

/// Filter predicate for `DurableStore::list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
}

/// Stable ordering for `list` results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    CreatedAtAsc,
    CreatedAtDesc,
}

/// Aggregate counts returned by the `Status` control-plane call.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStatus {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_satisfies_invariants() {
        let now = Utc::now();
        let job = Job::new("a".into(), "echo hi".into(), 3, now);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(!job.locked());
        assert!(job.next_retry_at.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(!JobState::Failed.is_terminal());
    }
}
