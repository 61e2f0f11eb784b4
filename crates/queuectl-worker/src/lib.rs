//! The worker runtime and stale-lock reaper for `queuectl`.
//!
//! A worker is a standalone OS process with a unique identity, running a
//! claim-execute-report loop against a `JobManager` injected at
//! construction. The stale-lock reap pass is consulted opportunistically
//! before each claim, never on its own schedule.

mod exec;
mod identity;
mod runtime;

pub use exec::{run_command, ExecOutcome};
pub use identity::worker_id;
pub use runtime::{listen_for_shutdown, ShutdownPhase, WorkerRuntime};
