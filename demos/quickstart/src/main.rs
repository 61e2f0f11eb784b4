//! Enqueues a handful of jobs — one that succeeds immediately, one that
//! fails twice before succeeding, one that always fails past its retry
//! ceiling — then runs a single in-process worker until the queue drains,
//! printing each job's final state.
//!
//! Run with `cargo run -p quickstart`.

use anyhow::Result;
use queuectl_core::{Config, EnqueueRequest, JobManager, JobState};
use queuectl_store_sqlite::SqliteStore;
use queuectl_worker::{ShutdownPhase, WorkerRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut config = Config::default();
    config.poll_interval = Duration::from_millis(200);
    config.backoff_base = 2;

    let db_dir = tempfile::tempdir()?;
    let db_path = db_dir.path().join("quickstart.db");
    let store = SqliteStore::open(db_path.to_str().unwrap()).await?;
    let jm = Arc::new(JobManager::new(Arc::new(store), config));

    jm.enqueue(EnqueueRequest {
        id: "greet".into(),
        command: "echo hello from queuectl".into(),
        max_retries: None,
    })
    .await?;

    // A script that fails twice (stamping a counter file) then succeeds.
    let flaky_marker = db_dir.path().join("flaky.count");
    jm.enqueue(EnqueueRequest {
        id: "flaky".into(),
        command: format!(
            "n=$(cat {0} 2>/dev/null || echo 0); echo $((n+1)) > {0}; [ $n -ge 2 ]",
            flaky_marker.display()
        ),
        max_retries: Some(3),
    })
    .await?;

    jm.enqueue(EnqueueRequest {
        id: "always-fails".into(),
        command: "exit 1".into(),
        max_retries: Some(1),
    })
    .await?;

    let (tx, rx) = watch::channel(ShutdownPhase::Running);
    let runtime = WorkerRuntime::new(Arc::clone(&jm), rx);
    let worker_id = runtime.id().to_string();
    println!("worker {worker_id} polling every {:?}", jm.config().poll_interval);

    let worker_handle = tokio::spawn(runtime.run());

    // Poll status until every job reaches a terminal state, then signal
    // the worker to stop draining and print final results.
    loop {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = jm.status().await?;
        if status.pending == 0 && status.processing == 0 && status.failed == 0 {
            break;
        }
    }

    tx.send(ShutdownPhase::Requested).ok();
    worker_handle.await?;

    for id in ["greet", "flaky", "always-fails"] {
        let job = jm.info(id).await?;
        let outcome = match job.state {
            JobState::Completed => format!("completed, output={:?}", job.output),
            JobState::Dead => format!("dead after {} attempts, error={:?}", job.attempts, job.error),
            other => format!("unexpected terminal state {other}"),
        };
        println!("{id}: {outcome}");
    }

    Ok(())
}
