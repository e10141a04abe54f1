//! Best-effort real-time scheduling for the playback thread.

use std::io;

/// Promote the calling thread to `SCHED_FIFO` at `priority`.
///
/// Usually requires elevated privileges; callers treat failure as non-fatal.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) fn promote_current_thread(priority: i32) -> io::Result<()> {
    // SAFETY: sched_param is plain data and pthread_self is always valid for the caller.
    let rc = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param)
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub(crate) fn promote_current_thread(_priority: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "real-time priority not supported on this platform",
    ))
}
