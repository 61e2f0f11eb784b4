//! Queue and worker tunables. Immutable once built: no interior mutability,
//! no globals.

use std::time::Duration;

/// Tunables consumed by the job manager, worker runtime, and stale-lock
/// reaper. The core never reads a config file itself; callers build a
/// `Config` however they like and hand it in.
#[derive(Debug, Clone)]
pub struct Config {
    pub default_max_retries: i64,
    pub backoff_base: i64,
    pub poll_interval: Duration,
    pub worker_timeout: Option<Duration>,
    pub stale_lock_threshold: Duration,
    pub output_cap_bytes: usize,
    pub shutdown_grace: Duration,
    pub db_path: String,
    /// Ambient logging knob; not a queue-semantics parameter.
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            backoff_base: 2,
            poll_interval: Duration::from_secs(1),
            worker_timeout: None,
            stale_lock_threshold: Duration::from_secs(60),
            output_cap_bytes: 10 * 1024,
            shutdown_grace: Duration::from_secs(10),
            db_path: default_db_path(),
            log_filter: "info".to_string(),
        }
    }
}

fn default_db_path() -> String {
    match std::env::var_os("HOME") {
        Some(home) => format!("{}/.queuectl/queuectl.db", home.to_string_lossy()),
        None => ".queuectl/queuectl.db".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cv = Config::default();
        assert_eq!(cv.default_max_retries, 3);
        assert_eq!(cv.backoff_base, 2);
        assert_eq!(cv.poll_interval, Duration::from_secs(1));
        assert_eq!(cv.worker_timeout, None);
        assert_eq!(cv.stale_lock_threshold, Duration::from_secs(60));
        assert_eq!(cv.output_cap_bytes, 10 * 1024);
        assert_eq!(cv.shutdown_grace, Duration::from_secs(10));
    }
}
