//! Command execution: spawn a child process through a shell-equivalent,
//! capture stdout/stderr to capped in-memory buffers, and enforce an
//! optional wall-clock timeout.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// The outcome of running a job's command once. Never a worker-loop fault:
/// spawn failures and timeouts are just another path to `Failure`, carrying
/// a diagnostic message the caller reports via `ReportFailure`.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Success { stdout: String },
    Failure { message: String },
}

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Build the shell-equivalent invocation for `command`. The worker never
/// parses the command itself; it hands the whole string to a shell.
fn build_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    }
    #[cfg(not(any(unix, windows)))]
    {
        // No shell available: split on whitespace and exec the first token.
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap_or_default();
        let mut cmd = Command::new(program);
        cmd.args(parts);
        cmd
    }
}

/// Drain a child's stdout/stderr concurrently into buffers capped at
/// `cap_bytes`, appending `TRUNCATION_MARKER` on overflow.
async fn capture_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(cap_bytes.min(8192));
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap_bytes {
                    let remaining = cap_bytes - buf.len();
                    let take = remaining.min(n);
                    buf.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// Wait until `force_kill` reports `true` (the shutdown escalation signal).
/// A receiver that never flips stays pending forever, which is exactly what
/// a caller with no escalation wiring wants from this in a `select!`.
async fn wait_for_force_kill(force_kill: &mut watch::Receiver<bool>) {
    loop {
        if *force_kill.borrow() {
            return;
        }
        if force_kill.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `command` to completion (or `timeout`), returning the classified
/// outcome. Exit code `0` is success; any non-zero, spawn failure, or
/// timeout is a failure. `force_kill` is the worker's second-signal
/// escalation channel: when it flips to `true` the child is killed
/// immediately and the outcome is reported as a failure.
pub async fn run_command(
    command: &str,
    timeout: Option<Duration>,
    output_cap_bytes: usize,
    mut force_kill: watch::Receiver<bool>,
) -> ExecOutcome {
    let mut cmd = build_command(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child: Child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutcome::Failure {
                message: format!("failed to spawn command: {e}"),
            }
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let wait_and_capture = async {
        let (status, stdout_text, stderr_text) = tokio::join!(
            child.wait(),
            capture_capped(stdout, output_cap_bytes),
            capture_capped(stderr, output_cap_bytes),
        );
        (status, stdout_text, stderr_text)
    };

    let timed_wait = async {
        match timeout {
            Some(d) => tokio::time::timeout(d, wait_and_capture).await.ok(),
            None => Some(wait_and_capture.await),
        }
    };

    let (status, stdout_text, stderr_text) = tokio::select! {
        result = timed_wait => match result {
            Some(result) => result,
            None => {
                let _ = child.kill().await;
                return ExecOutcome::Failure {
                    message: format!("command timed out after {:.1}s", timeout.unwrap().as_secs_f64()),
                };
            }
        },
        _ = wait_for_force_kill(&mut force_kill) => {
            let _ = child.kill().await;
            return ExecOutcome::Failure {
                message: "worker shutdown escalated: child process killed".to_string(),
            };
        }
    };
    match status {
        Ok(status) if status.success() => ExecOutcome::Success { stdout: stdout_text.trim().to_string() },
        Ok(status) => ExecOutcome::Failure {
            message: if stderr_text.trim().is_empty() {
                format!("command exited with status {status}")
            } else {
                stderr_text
            },
        },
        Err(e) => ExecOutcome::Failure {
            message: format!("failed to wait on child process: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A force-kill channel that never escalates, for tests that don't
    /// exercise shutdown.
    fn no_escalation() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[tokio::test]
    async fn successful_command_captures_trimmed_stdout() {
        let outcome = run_command("echo hi", None, 1024, no_escalation()).await;
        match outcome {
            ExecOutcome::Success { stdout } => assert_eq!(stdout, "hi"),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_stderr() {
        let outcome = run_command("echo boom 1>&2; exit 1", None, 1024, no_escalation()).await;
        match outcome {
            ExecOutcome::Failure { message } => assert!(message.contains("boom")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_child_and_reports_failure() {
        let outcome = run_command("sleep 5", Some(Duration::from_millis(50)), 1024, no_escalation()).await;
        match outcome {
            ExecOutcome::Failure { message } => assert!(message.contains("timed out")),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_beyond_cap_is_truncated_with_marker() {
        let outcome = run_command("yes | head -c 4096", None, 16, no_escalation()).await;
        match outcome {
            ExecOutcome::Success { stdout } => assert!(stdout.contains("truncated")),
            other => panic!("expected success with truncation marker, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_on_nonexistent_program_is_reported() {
        // Bypass the shell by asserting the shell itself reports exec failure.
        let outcome = run_command("this-binary-should-not-exist-xyz", None, 1024, no_escalation()).await;
        match outcome {
            ExecOutcome::Failure { .. } => {}
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn force_kill_escalation_interrupts_running_child() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });
        let outcome = run_command("sleep 5", None, 1024, rx).await;
        match outcome {
            ExecOutcome::Failure { message } => assert!(message.contains("killed")),
            other => panic!("expected escalated kill failure, got {other:?}"),
        }
    }
}
