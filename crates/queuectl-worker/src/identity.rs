//! Worker identity: derived from the OS process id plus a host-local salt,
//! stable for the process lifetime.

/// Build a worker identity of the form `"{host}-{pid}-{salt}"`. The salt is
/// generated once per process so restarts of the same PID (PID reuse after
/// a crash) don't collide with a still-live lock from a prior incarnation.
pub fn worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let pid = std::process::id();
    let salt = fastrand::u32(..);
    format!("{host}-{pid}-{salt:08x}")
}
