//! Cross-process lock stored inside the shared segment
//!
//! The lock word holds an owner token `(pid << 32) | ticket`, zero when free.
//! Waiters spin briefly, then back off with short sleeps. While backing off
//! they check whether the owner is stale:
//!
//! - the owning process no longer exists, or
//! - the same token has been observed for longer than the stale timeout.
//!
//! A stale lock is stolen with a compare-exchange on the exact token that was
//! observed, and the new guard reports `recovered() == true` so the caller can
//! repair any half-finished mutation.

use rustix::io::Errno;
use rustix::process::{getpid, test_kill_process, Pid};
use rustix::time::{clock_gettime, ClockId};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Spins before switching to sleep-based backoff
const SPIN_LIMIT: u32 = 128;

/// Sleep between slow-path attempts
const BACKOFF: Duration = Duration::from_micros(50);

/// Process-local ticket so threads of one process hold distinct tokens
static NEXT_TICKET: AtomicU32 = AtomicU32::new(1);

#[inline]
pub(crate) fn current_pid() -> u32 {
    getpid().as_raw_nonzero().get() as u32
}

/// Whether a process with this pid still exists
pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == current_pid() {
        return true;
    }
    let Some(pid) = Pid::from_raw(pid as i32) else {
        return false;
    };
    // EPERM means the process exists under another user
    !matches!(test_kill_process(pid), Err(Errno::SRCH))
}

fn monotonic_ns() -> u64 {
    let ts = clock_gettime(ClockId::Monotonic);
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

#[inline]
fn owner_pid(token: u64) -> u32 {
    (token >> 32) as u32
}

fn next_token() -> u64 {
    let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
    ((current_pid() as u64) << 32) | ticket as u64
}

/// Lock state stored in shared memory
#[repr(C)]
pub struct ShmLock {
    owner: AtomicU64,
    acquired_at_ns: AtomicU64,
    recoveries: AtomicU64,
    stale_timeout_ns: u64,
}

/// Snapshot of the current holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub held_for: Duration,
}

impl ShmLock {
    /// A free lock, for use outside shared memory
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            owner: AtomicU64::new(0),
            acquired_at_ns: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            stale_timeout_ns: stale_timeout.as_nanos() as u64,
        }
    }

    /// Initialize a lock in place
    ///
    /// # Safety
    /// Pointer must be valid, aligned, and not yet visible to other processes
    pub unsafe fn init(ptr: *mut Self, stale_timeout: Duration) {
        std::ptr::write(ptr, Self::new(stale_timeout));
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_nanos(self.stale_timeout_ns)
    }

    /// Number of times a stale owner was displaced
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<LockHolder> {
        let token = self.owner.load(Ordering::Acquire);
        if token == 0 {
            return None;
        }
        let since = self.acquired_at_ns.load(Ordering::Acquire);
        Some(LockHolder {
            pid: owner_pid(token),
            held_for: Duration::from_nanos(monotonic_ns().saturating_sub(since)),
        })
    }

    /// Acquire the lock, recovering it from a stale owner if needed
    pub fn lock(&self) -> ShmLockGuard<'_> {
        let token = next_token();
        let mut spins = 0u32;
        let mut observed: Option<(u64, Instant)> = None;

        loop {
            let current = match self
                .owner
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return self.granted(token, false),
                Err(current) => current,
            };

            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
                continue;
            }

            let expired = match observed {
                Some((seen, since)) if seen == current => since.elapsed() >= self.stale_timeout(),
                _ => {
                    observed = Some((current, Instant::now()));
                    false
                }
            };

            let pid = owner_pid(current);
            if expired || !process_alive(pid) {
                if self
                    .owner
                    .compare_exchange(current, token, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.recoveries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        stale_pid = pid,
                        expired,
                        "recovered segment lock from stale owner"
                    );
                    return self.granted(token, true);
                }
                observed = None;
                continue;
            }

            std::thread::sleep(BACKOFF);
        }
    }

    /// Mark the lock as held by `pid`, as a crashed holder would leave it
    #[cfg(test)]
    pub(crate) fn force_owner(&self, pid: u32) {
        self.owner.store(((pid as u64) << 32) | 1, Ordering::Release);
        self.acquired_at_ns.store(monotonic_ns(), Ordering::Release);
    }

    fn granted(&self, token: u64, recovered: bool) -> ShmLockGuard<'_> {
        self.acquired_at_ns.store(monotonic_ns(), Ordering::Release);
        ShmLockGuard {
            lock: self,
            token,
            recovered,
        }
    }
}

/// RAII guard; releases the lock on drop
pub struct ShmLockGuard<'a> {
    lock: &'a ShmLock,
    token: u64,
    recovered: bool,
}

impl ShmLockGuard<'_> {
    /// Whether this acquisition displaced a stale owner
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for ShmLockGuard<'_> {
    fn drop(&mut self) {
        if self
            .lock
            .owner
            .compare_exchange(self.token, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            tracing::warn!("segment lock was taken over while held");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    struct Shared {
        lock: ShmLock,
        counter: UnsafeCell<u64>,
    }

    unsafe impl Sync for Shared {}

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let shared = Arc::new(Shared {
            lock: ShmLock::new(Duration::from_secs(5)),
            counter: UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = shared.lock.lock();
                        unsafe { *shared.counter.get() += 1 };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, 4000);
        assert!(shared.lock.holder().is_none());
        assert_eq!(shared.lock.recoveries(), 0);
    }

    #[test]
    fn test_recovers_from_dead_owner() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let lock = ShmLock::new(Duration::from_secs(60));
        lock.owner.store(((dead_pid as u64) << 32) | 1, Ordering::Release);
        assert_eq!(lock.holder().unwrap().pid, dead_pid);

        let guard = lock.lock();
        assert!(guard.recovered());
        assert_eq!(lock.holder().unwrap().pid, current_pid());
        drop(guard);

        assert_eq!(lock.recoveries(), 1);
        assert!(lock.holder().is_none());
    }

    #[test]
    fn test_recovers_after_stale_timeout() {
        let lock = ShmLock::new(Duration::from_millis(50));
        // A live pid that never releases
        lock.owner.store(((current_pid() as u64) << 32) | 0xFFFF_FFFF, Ordering::Release);

        let start = Instant::now();
        let guard = lock.lock();
        assert!(guard.recovered());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(current_pid()));
        assert!(!process_alive(0));
    }
}
