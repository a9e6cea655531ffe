/// Process hardening applied at daemon startup.
///
/// Call first thing in `main()`, after logging is up but before any key
/// material can exist.  Both steps are best-effort: failure is logged and
/// the daemon carries on.
///
/// 1. `PR_SET_DUMPABLE 0` keeps other processes out of `/proc/<pid>/mem`
///    and stops core dumps, so key bytes cannot land on disk via a crash.
/// 2. `mlockall(MCL_CURRENT | MCL_FUTURE)` pins all pages in RAM so key
///    bytes are never swapped out.  Needs `CAP_IPC_LOCK`; without it the
///    call fails and is logged.
#[cfg(unix)]
pub fn secure_bootstrap() {
    disable_dumps();
    pin_memory();
}

/// No-op off unix.
#[cfg(not(unix))]
pub fn secure_bootstrap() {}

#[cfg(unix)]
fn disable_dumps() {
    // SAFETY: prctl with PR_SET_DUMPABLE and integer arguments is safe.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::info!("core dumps and /proc/pid/mem access disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (continuing): {err}");
    }
}

#[cfg(unix)]
fn pin_memory() {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::info!("memory pages locked in RAM");
    } else {
        // Usually EPERM (no CAP_IPC_LOCK) or ENOMEM under RLIMIT_MEMLOCK.
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed (continuing without memory locking): {err}");
    }
}
