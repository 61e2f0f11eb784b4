//! The worker runtime: claim, execute, report, repeat, with cooperative
//! shutdown that never orphans an in-flight job.

use crate::exec::{run_command, ExecOutcome};
use crate::identity::worker_id;
use queuectl_core::JobManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Shutdown escalation state shared between the signal listener and the
/// main loop. `Requested` is cooperative: the loop finishes the in-flight
/// job and exits before claiming another. A second signal inside
/// `shutdown_grace` escalates to `ForceKill`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Requested,
    ForceKill,
}

/// One claim-execute-report cycle at a time: a worker never begins a second
/// claim before the current one has reported.
pub struct WorkerRuntime {
    id: String,
    jm: Arc<JobManager>,
    shutdown: watch::Receiver<ShutdownPhase>,
    /// The worker's single force-kill adapter, built once for the process's
    /// lifetime and cheaply cloned into each job's `run_command` call —
    /// not rebuilt (and re-spawned) per job.
    force_kill: watch::Receiver<bool>,
}

impl WorkerRuntime {
    pub fn new(jm: Arc<JobManager>, shutdown: watch::Receiver<ShutdownPhase>) -> Self {
        let force_kill = force_kill_receiver(shutdown.clone());
        Self { id: worker_id(), jm, shutdown, force_kill }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the main loop until shutdown is requested and the current cycle
    /// (if any) has reported.
    pub async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");
        loop {
            if *self.shutdown.borrow() != ShutdownPhase::Running {
                info!(worker_id = %self.id, "shutdown requested, draining");
                break;
            }

            if let Err(e) = self.jm.reap_stale().await {
                warn!(worker_id = %self.id, error = %e, "stale-lock reap pass failed, continuing");
            }

            match self.jm.claim(&self.id).await {
                Ok(Some(job)) => self.execute_and_report(job.id, job.command).await,
                Ok(None) => {
                    self.sleep_or_wake(self.jm.config().poll_interval).await;
                }
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "claim failed, backing off");
                    self.sleep_or_wake(self.jm.config().poll_interval).await;
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Sleep for `d`, but wake early if shutdown state changes so drain
    /// latency isn't bounded by a full idle poll interval.
    async fn sleep_or_wake(&mut self, d: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn execute_and_report(&mut self, id: String, command: String) {
        let config = self.jm.config().clone();

        let outcome =
            run_command(&command, config.worker_timeout, config.output_cap_bytes, self.force_kill.clone()).await;

        let report = match outcome {
            ExecOutcome::Success { stdout } => self.jm.report_success(&id, &self.id, stdout).await,
            ExecOutcome::Failure { message } => self.jm.report_failure(&id, &self.id, message).await,
        };

        match report {
            Ok(true) => info!(worker_id = %self.id, job_id = %id, "job cycle reported"),
            Ok(false) => warn!(worker_id = %self.id, job_id = %id, "lock lost before outcome could be reported"),
            Err(e) => error!(worker_id = %self.id, job_id = %id, error = %e, "failed to report job outcome"),
        }
    }
}

/// Adapt the runtime's `ShutdownPhase` watch into the `bool` "kill now"
/// signal `exec::run_command` understands.
fn force_kill_receiver(mut phase: watch::Receiver<ShutdownPhase>) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(*phase.borrow() == ShutdownPhase::ForceKill);
    tokio::spawn(async move {
        while phase.changed().await.is_ok() {
            let force = *phase.borrow() == ShutdownPhase::ForceKill;
            if tx.send(force).is_err() {
                return;
            }
            if force {
                return;
            }
        }
    });
    rx
}

/// Drive the `ShutdownPhase` channel from OS signals. The first
/// interrupt/terminate signal moves to `Requested`; a second one inside
/// `shutdown_grace` moves to `ForceKill`.
pub async fn listen_for_shutdown(tx: watch::Sender<ShutdownPhase>, shutdown_grace: Duration) {
    wait_for_signal().await;
    info!("received shutdown signal, draining in-flight job");
    let _ = tx.send(ShutdownPhase::Requested);

    let escalate = tokio::time::timeout(shutdown_grace, wait_for_signal()).await;
    if escalate.is_ok() {
        warn!("received second shutdown signal, escalating to force-kill");
        let _ = tx.send(ShutdownPhase::ForceKill);
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::{Config, EnqueueRequest, JobState};
    use queuectl_testing::InMemoryStore;

    fn manager() -> Arc<JobManager> {
        Arc::new(JobManager::new(Arc::new(InMemoryStore::new()), Config::default()))
    }

    #[tokio::test]
    async fn happy_path_claims_executes_and_completes() {
        let jm = manager();
        jm.enqueue(EnqueueRequest { id: "a".into(), command: "echo hi".into(), max_retries: None })
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(ShutdownPhase::Running);
        let mut runtime = WorkerRuntime::new(Arc::clone(&jm), rx);
        runtime.jm.claim(&runtime.id).await.unwrap();
        runtime.execute_and_report("a".into(), "echo hi".into()).await;

        let job = jm.info("a").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn failing_command_schedules_retry() {
        let jm = manager();
        jm.enqueue(EnqueueRequest { id: "a".into(), command: "exit 1".into(), max_retries: Some(3) })
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(ShutdownPhase::Running);
        let mut runtime = WorkerRuntime::new(Arc::clone(&jm), rx);
        runtime.jm.claim(&runtime.id).await.unwrap();
        runtime.execute_and_report("a".into(), "exit 1".into()).await;

        let job = jm.info("a").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.next_retry_at.is_some());
    }

    /// Scenario 5 (crash recovery): worker A claims a job and never reports
    /// (simulating a crash mid-execution); after `stale_lock_threshold` the
    /// reap pass reclaims the lock, and worker B can claim and complete the
    /// same job without the crash's attempt ever being double-counted.
    #[tokio::test]
    async fn stale_lock_is_reaped_and_job_completes_on_second_worker() {
        let mut config = Config::default();
        config.stale_lock_threshold = Duration::from_millis(0);
        let jm = Arc::new(JobManager::new(Arc::new(InMemoryStore::new()), config));
        jm.enqueue(EnqueueRequest { id: "a".into(), command: "echo hi".into(), max_retries: None })
            .await
            .unwrap();

        let claimed = jm.claim("worker-a").await.unwrap().expect("eligible");
        assert_eq!(claimed.locked_by.as_deref(), Some("worker-a"));
        // worker-a "crashes" here: no report is ever issued for its claim.

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reaped = jm.reap_stale().await.unwrap();
        assert_eq!(reaped, vec!["a".to_string()]);

        let after_reap = jm.info("a").await.unwrap();
        assert_eq!(after_reap.state, JobState::Failed);
        assert_eq!(after_reap.attempts, 0, "reap does not count as an attempt");
        assert!(after_reap.locked_by.is_none());

        let (_tx, rx) = watch::channel(ShutdownPhase::Running);
        let mut runtime_b = WorkerRuntime::new(Arc::clone(&jm), rx);
        let reclaimed = jm.claim(&runtime_b.id).await.unwrap().expect("eligible after reap");
        assert_eq!(reclaimed.locked_by.as_deref(), Some(runtime_b.id()));
        runtime_b.execute_and_report("a".into(), "echo hi".into()).await;

        let job = jm.info("a").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output.as_deref(), Some("hi"));
        // Only the post-reap execution ever reported a real outcome.
        assert_eq!(job.attempts, 0);
    }

    /// Scenario 1 (happy path), driven through the real `run()` loop instead
    /// of calling `execute_and_report` directly: start a worker, let it poll
    /// and drain, then request shutdown and confirm it stops promptly.
    #[tokio::test]
    async fn run_loop_drains_queue_then_exits_on_shutdown() {
        let mut config = Config::default();
        config.poll_interval = Duration::from_millis(10);
        let jm = Arc::new(JobManager::new(Arc::new(InMemoryStore::new()), config));
        jm.enqueue(EnqueueRequest { id: "a".into(), command: "echo hi".into(), max_retries: None })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(ShutdownPhase::Running);
        let runtime = WorkerRuntime::new(Arc::clone(&jm), rx);
        let handle = tokio::spawn(runtime.run());

        for _ in 0..50 {
            if jm.info("a").await.unwrap().state == JobState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let job = jm.info("a").await.unwrap();
        assert_eq!(job.state, JobState::Completed);

        tx.send(ShutdownPhase::Requested).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should exit promptly after shutdown")
            .unwrap();
    }
}
