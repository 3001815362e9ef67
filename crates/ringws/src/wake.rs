use crate::{IoErr, IoResult};
use crossbeam_utils::CachePadded;
use log::error;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{fence, AtomicBool, Ordering};

// =============================================================================
// SLEEP/WAKE HANDSHAKE
// =============================================================================
//
// A consumer thread (worker or app) parks only when every source it drains is
// empty, and a producer must never publish into a parked consumer without
// waking it. The handshake:
//
// **Consumer (parking):**
// 1. Drain all rings until empty
// 2. Store sleep flag = true
// 3. SeqCst fence
// 4. Re-check all rings; if any has data, clear the flag and keep running
// 5. Otherwise block on the eventfd; on return, clear the flag
//
// **Producer (publishing, per update-queue flush entry):**
// 1. Release-store the new writer cursor to the shared cell
// 2. SeqCst fence
// 3. Relaxed-load the consumer's sleep flag
// 4. If set, write one byte to the consumer's eventfd
//
// The two SeqCst fences order the consumer's flag store against its ring
// re-check, and the producer's cursor store against its flag load. Whatever
// way the two sequences interleave, either the consumer's step-4 re-check
// sees the cursor, or the producer's step-3 load sees the flag — so a parked
// consumer with pending data always gets the eventfd write. Compiler fences
// alone would do on TSO hardware, where stores are not reordered with later
// stores; portable code pays for the real fences.
//
// =============================================================================

/// One thread's "currently parked" flag, padded to its own cache line so
/// producers polling it never contend with neighbouring state.
#[derive(Debug, Default)]
pub struct SleepState {
    asleep: CachePadded<AtomicBool>,
}

impl SleepState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumer-side steps 2–3 of the handshake. After this returns, the
    /// caller must re-check its rings before actually blocking.
    #[inline]
    pub fn prepare_park(&self) {
        self.asleep.store(true, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Consumer-side: leave the parked state (after waking, or after the
    /// re-check found data).
    #[inline]
    pub fn cancel_park(&self) {
        self.asleep.store(false, Ordering::Relaxed);
    }

    /// Producer-side step 3. Callers must fence (step 2) after their cursor
    /// store; `RingUpdateQueue::flush` does.
    #[inline]
    pub fn is_asleep(&self) -> bool {
        self.asleep.load(Ordering::Relaxed)
    }
}

/// Thin owner of an `eventfd` used as a cross-thread doorbell.
///
/// Worker eventfds are non-blocking and registered in the worker's epoll set;
/// app eventfds are blocking and parked on directly with `wait`.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new(nonblocking: bool) -> IoResult<Self> {
        let mut flags = libc::EFD_CLOEXEC;
        if nonblocking {
            flags |= libc::EFD_NONBLOCK;
        }
        // SAFETY: plain syscall, no pointers involved.
        let fd = unsafe { libc::eventfd(0, flags) };
        if fd == -1 {
            error!(
                "eventfd() failed: {}",
                std::io::Error::last_os_error()
            );
            return Err(IoErr::Fatal);
        }
        Ok(Self { fd })
    }

    /// Producer-side step 4: add one to the counter, waking any blocked
    /// reader. A would-block result means the counter is already saturated,
    /// which is as good as a successful wake.
    pub fn raise(&self) -> IoResult {
        let one: u64 = 1;
        loop {
            // SAFETY: writes 8 bytes from a stack u64, the size eventfd requires.
            let ret = unsafe {
                libc::write(self.fd, std::ptr::addr_of!(one).cast(), 8)
            };
            if ret == 8 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(()),
                _ => {
                    error!("eventfd write({}) failed: {}", self.fd, err);
                    return Err(IoErr::Fatal);
                }
            }
        }
    }

    /// Consumer-side step 5 for app threads: block until a producer raises
    /// the counter, then clear it.
    pub fn wait(&self) -> IoResult {
        let mut count: u64 = 0;
        loop {
            // SAFETY: reads 8 bytes into a stack u64, the size eventfd requires.
            let ret = unsafe {
                libc::read(self.fd, std::ptr::addr_of_mut!(count).cast(), 8)
            };
            if ret == 8 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => {
                    error!("eventfd read({}) failed: {}", self.fd, err);
                    return Err(IoErr::Fatal);
                }
            }
        }
    }

    /// Clear the counter without blocking. Used by workers after epoll
    /// reports their eventfd readable.
    pub fn drain(&self) -> IoResult {
        let mut count: u64 = 0;
        loop {
            // SAFETY: reads 8 bytes into a stack u64, the size eventfd requires.
            let ret = unsafe {
                libc::read(self.fd, std::ptr::addr_of_mut!(count).cast(), 8)
            };
            if ret == 8 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(()),
                _ => {
                    error!("eventfd read({}) failed: {}", self.fd, err);
                    return Err(IoErr::Fatal);
                }
            }
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // SAFETY: fd was returned by eventfd() and is owned by self.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A consumer thread's wakeable identity: its sleep flag plus its doorbell.
/// Producers hold one `Arc<WakePort>` per consumer they may need to wake.
#[derive(Debug)]
pub struct WakePort {
    pub sleep: SleepState,
    pub eventfd: EventFd,
}

impl WakePort {
    pub fn new(nonblocking_eventfd: bool) -> IoResult<Self> {
        Ok(Self {
            sleep: SleepState::new(),
            eventfd: EventFd::new(nonblocking_eventfd)?,
        })
    }

    /// Producer-side steps 2–4 in one call, assuming the cursor store already
    /// happened: fence, check the flag, raise the doorbell if needed.
    pub fn wake_if_asleep(&self) -> IoResult {
        fence(Ordering::SeqCst);
        if self.sleep.is_asleep() {
            self.eventfd.raise()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_raise_then_wait() {
        let efd = EventFd::new(false).unwrap();
        efd.raise().unwrap();
        efd.wait().unwrap();
    }

    #[test]
    fn test_eventfd_drain_empty_is_ok() {
        let efd = EventFd::new(true).unwrap();
        efd.drain().unwrap();
        efd.raise().unwrap();
        efd.raise().unwrap();
        efd.drain().unwrap();
        efd.drain().unwrap();
    }

    #[test]
    fn test_sleep_state_flips() {
        let state = SleepState::new();
        assert!(!state.is_asleep());
        state.prepare_park();
        assert!(state.is_asleep());
        state.cancel_park();
        assert!(!state.is_asleep());
    }

    #[test]
    fn test_wake_port_wakes_parked_consumer() {
        let port = WakePort::new(false).unwrap();
        port.sleep.prepare_park();
        port.wake_if_asleep().unwrap();
        // The doorbell was raised, so a blocking wait returns immediately.
        port.eventfd.wait().unwrap();
        port.sleep.cancel_park();
    }
}
