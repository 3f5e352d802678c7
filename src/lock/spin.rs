//! Single-flag spinlocks

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::utils::CachePadded;

use super::{Backoff, RawLock, TryLock};

/// Test-and-set spinlock with exponential backoff.
///
/// Every attempt is an atomic swap, so waiters keep the flag's cache line
/// bouncing between cores. No fairness.
#[derive(Debug)]
pub struct TasLock {
    locked: CachePadded<AtomicBool>,
    backoff: Backoff,
}

impl TasLock {
    /// Exponent the backoff starts from on the first failed attempt.
    const INITIAL_EXPONENT: u32 = 3;

    /// Create an unlocked lock with the default backoff.
    pub fn new() -> Self {
        Self::with_backoff(Backoff::Exponential { max_exponent: 16 })
    }

    /// Create an unlocked lock that waits with `backoff` between attempts.
    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            locked: CachePadded::new(AtomicBool::new(false)),
            backoff,
        }
    }
}

impl Default for TasLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for TasLock {
    #[inline]
    fn lock(&self) {
        let mut iters = Self::INITIAL_EXPONENT;
        while self.locked.swap(true, Ordering::Acquire) {
            iters = iters.saturating_add(1);
            self.backoff.wait(iters);
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl TryLock for TasLock {
    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Test-and-test-and-set spinlock with exponential backoff.
///
/// Waiters spin on a plain load and only attempt the swap once the flag
/// reads clear, which keeps the line shared while the lock is held.
#[derive(Debug)]
pub struct TtasLock {
    locked: CachePadded<AtomicBool>,
    backoff: Backoff,
}

impl TtasLock {
    /// Create an unlocked lock with the default backoff.
    pub fn new() -> Self {
        Self::with_backoff(Backoff::Exponential { max_exponent: 14 })
    }

    /// Create an unlocked lock that waits with `backoff` while the flag is set.
    pub fn with_backoff(backoff: Backoff) -> Self {
        Self {
            locked: CachePadded::new(AtomicBool::new(false)),
            backoff,
        }
    }
}

impl Default for TtasLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for TtasLock {
    #[inline]
    fn lock(&self) {
        let mut iters = 0;
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                self.backoff.wait(iters);
                iters = iters.saturating_add(1);
            }
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl TryLock for TtasLock {
    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}
