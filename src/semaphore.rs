//! Counting semaphores
//!
//! Two implementations of one [`Semaphore`] interface: a spinning one for
//! short waits between worker threads and a blocking one that parks the
//! waiter on a condition variable.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::lock::Backoff;

/// A counting semaphore.
pub trait Semaphore: Send + Sync {
    /// Release one unit.
    fn up(&self);

    /// Acquire one unit, waiting until one is available.
    fn down(&self);
}

/// Semaphore that busy-waits with exponential backoff.
#[derive(Debug)]
pub struct SpinSemaphore {
    count: AtomicUsize,
    backoff: Backoff,
}

impl SpinSemaphore {
    const INITIAL_EXPONENT: u32 = 10;

    /// Create a semaphore holding `initial` units.
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
            backoff: Backoff::Exponential { max_exponent: 16 },
        }
    }

    /// Take a unit if one is available right now.
    pub fn try_down(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Units currently available.
    pub fn available(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Semaphore for SpinSemaphore {
    fn up(&self) {
        self.count.fetch_add(1, Ordering::Release);
    }

    fn down(&self) {
        let mut iters = Self::INITIAL_EXPONENT;
        while !self.try_down() {
            iters = iters.saturating_add(1);
            self.backoff.wait(iters);
        }
    }
}

/// Semaphore that parks waiters.
#[derive(Debug)]
pub struct BlockingSemaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl BlockingSemaphore {
    /// Create a semaphore holding `initial` units.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }
}

impl Semaphore for BlockingSemaphore {
    fn up(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    fn down(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }
}
