use crate::{IoErr, IoResult};
use log::error;

/// Milliseconds from the monotonic coarse clock. The coarse source is a few
/// milliseconds stale, which is plenty for idle-peer pruning and app-level
/// timeouts, and avoids a hardware clock read per call.
pub fn monotonic_ms() -> IoResult<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for the duration of the call.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_COARSE, &mut ts) };
    if ret == -1 {
        error!(
            "clock_gettime(CLOCK_MONOTONIC_COARSE) failed: {}",
            std::io::Error::last_os_error()
        );
        return Err(IoErr::Fatal);
    }
    Ok(ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000)
}
