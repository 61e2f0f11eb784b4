//! Error taxonomy for the control plane: validation, not-found, storage
//! faults. Execution failures are surfaced as data through the state
//! machine (`Job.error`, `JobState::Failed`/`Dead`), never as an error
//! variant here. Lock-lost is recovered locally by the worker (`Ok(false)`
//! from `report_success`/`report_failure`, an id simply absent from
//! `reap_stale`'s result) rather than raised here, per §7's propagation
//! policy: it never needs to reach a control-plane caller.

use thiserror::Error;

/// Errors the control plane and `JobManager` can return.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job id must not be empty")]
    EmptyId,

    #[error("command must not be empty")]
    EmptyCommand,

    #[error("max_retries must not be negative")]
    NegativeMaxRetries,

    #[error("job '{0}' already exists")]
    DuplicateId(String),

    #[error("job '{0}' not found")]
    NotFound(String),

    #[error("job '{0}' is not in the dead letter queue")]
    NotInDlq(String),

    #[error("durable store is unavailable: {0}")]
    StorageUnavailable(#[source] anyhow::Error),
}

/// The coarse category a caller can safely branch on without knowing the
/// storage engine's internals: lets a CLI or HTTP layer decide what's safe
/// to log or surface to a client without matching every error variant. The
/// CLI uses this to implement §7's propagation policy: validation and
/// not-found errors are shown as-is, storage faults are logged in full but
/// shown to the operator only as a generic "unavailable" outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    Validation,
    NotFound,
    StorageUnavailable,
}

pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

impl Categorizable for QueueError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            QueueError::EmptyId | QueueError::EmptyCommand | QueueError::NegativeMaxRetries => {
                SafeErrorCategory::Validation
            }
            QueueError::DuplicateId(_) => SafeErrorCategory::Validation,
            QueueError::NotFound(_) | QueueError::NotInDlq(_) => SafeErrorCategory::NotFound,
            QueueError::StorageUnavailable(_) => SafeErrorCategory::StorageUnavailable,
        }
    }
}
