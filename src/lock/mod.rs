//! Mutual-exclusion primitives used to protect the runtime's shared state
//!
//! Every lock implements [`RawLock`]; the spinning locks and the native
//! mutex also implement [`TryLock`]. Call sites inside the runtime are
//! written against [`Locked`], which owns the protected data and hands out
//! RAII guards, so the concrete strategy is chosen with a [`LockKind`] at
//! construction time rather than baked into the code.

#![allow(unsafe_code)] // UnsafeCell access guarded by the lock

mod native;
mod queued;
mod spin;

pub use native::NativeMutex;
pub use queued::{AndersonLock, ClhLock, TicketLock};
pub use spin::{TasLock, TtasLock};

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use crate::error::Error;

/// A mutual-exclusion strategy.
pub trait RawLock: Send + Sync {
    /// Acquire the lock, waiting as long as necessary.
    fn lock(&self);

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held. Releasing a lock that is not held breaks
    /// mutual exclusion for every other user of the lock.
    unsafe fn unlock(&self);
}

/// A lock that can also be acquired without waiting.
pub trait TryLock: RawLock {
    /// Attempt to acquire the lock, failing if it is contended.
    fn try_lock(&self) -> bool;

    /// Whether the lock is currently held by anyone.
    fn is_locked(&self) -> bool;
}

/// Busy-wait strategy used by the spinning locks between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Spin `2^min(amount, max_exponent)` times.
    Exponential {
        /// Upper bound on the exponent
        max_exponent: u32,
    },
    /// Spin `min(amount, max_spins)` times.
    Linear {
        /// Upper bound on the number of spins
        max_spins: u32,
    },
}

impl Backoff {
    /// Number of spin iterations for the given relative amount.
    pub fn spins(&self, amount: u32) -> u64 {
        match *self {
            Backoff::None => 0,
            Backoff::Exponential { max_exponent } => 1u64 << amount.min(max_exponent).min(63),
            Backoff::Linear { max_spins } => u64::from(amount.min(max_spins)),
        }
    }

    /// Busy-wait for the given relative amount.
    #[inline]
    pub fn wait(&self, amount: u32) {
        for _ in 0..self.spins(amount) {
            std::hint::spin_loop();
        }
    }
}

/// The closed set of lock strategies a [`Locked`] can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Test-and-set with exponential backoff
    Tas,
    /// Test-and-test-and-set with exponential backoff
    Ttas,
    /// Ticket lock with linear backoff
    Ticket,
    /// Array-based queuing lock
    Anderson {
        /// Maximum number of threads that may contend at once
        slots: usize,
    },
    /// CLH queue lock
    Clh,
    /// The platform's blocking mutex
    Native,
}

impl Default for LockKind {
    fn default() -> Self {
        LockKind::Ttas
    }
}

impl LockKind {
    /// Construct a lock of this kind.
    pub fn build(self) -> AnyLock {
        match self {
            LockKind::Tas => AnyLock::Tas(TasLock::new()),
            LockKind::Ttas => AnyLock::Ttas(TtasLock::new()),
            LockKind::Ticket => AnyLock::Ticket(TicketLock::new()),
            LockKind::Anderson { slots } => AnyLock::Anderson(AndersonLock::new(slots)),
            LockKind::Clh => AnyLock::Clh(ClhLock::new()),
            LockKind::Native => AnyLock::Native(NativeMutex::new()),
        }
    }
}

impl FromStr for LockKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "tas" => Ok(LockKind::Tas),
            "ttas" => Ok(LockKind::Ttas),
            "ticket" => Ok(LockKind::Ticket),
            "clh" => Ok(LockKind::Clh),
            "native" | "mutex" => Ok(LockKind::Native),
            "anderson" => Ok(LockKind::Anderson { slots: 64 }),
            other => match other.strip_prefix("anderson:") {
                Some(n) => n
                    .parse::<usize>()
                    .ok()
                    .filter(|&slots| slots > 0)
                    .map(|slots| LockKind::Anderson { slots })
                    .ok_or_else(|| Error::ConfigError {
                        reason: format!("invalid Anderson slot count in {:?}", s),
                    }),
                None => Err(Error::ConfigError {
                    reason: format!("unknown lock kind {:?}", s),
                }),
            },
        }
    }
}

/// A lock whose strategy was chosen at runtime.
pub enum AnyLock {
    /// See [`TasLock`]
    Tas(TasLock),
    /// See [`TtasLock`]
    Ttas(TtasLock),
    /// See [`TicketLock`]
    Ticket(TicketLock),
    /// See [`AndersonLock`]
    Anderson(AndersonLock),
    /// See [`ClhLock`]
    Clh(ClhLock),
    /// See [`NativeMutex`]
    Native(NativeMutex),
}

impl AnyLock {
    /// The kind this lock was built from.
    pub fn kind(&self) -> LockKind {
        match self {
            AnyLock::Tas(_) => LockKind::Tas,
            AnyLock::Ttas(_) => LockKind::Ttas,
            AnyLock::Ticket(_) => LockKind::Ticket,
            AnyLock::Anderson(l) => LockKind::Anderson { slots: l.slots() },
            AnyLock::Clh(_) => LockKind::Clh,
            AnyLock::Native(_) => LockKind::Native,
        }
    }
}

impl Default for AnyLock {
    fn default() -> Self {
        LockKind::default().build()
    }
}

impl fmt::Debug for AnyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyLock").field(&self.kind()).finish()
    }
}

impl RawLock for AnyLock {
    #[inline]
    fn lock(&self) {
        match self {
            AnyLock::Tas(l) => l.lock(),
            AnyLock::Ttas(l) => l.lock(),
            AnyLock::Ticket(l) => l.lock(),
            AnyLock::Anderson(l) => l.lock(),
            AnyLock::Clh(l) => l.lock(),
            AnyLock::Native(l) => l.lock(),
        }
    }

    #[inline]
    unsafe fn unlock(&self) {
        match self {
            AnyLock::Tas(l) => l.unlock(),
            AnyLock::Ttas(l) => l.unlock(),
            AnyLock::Ticket(l) => l.unlock(),
            AnyLock::Anderson(l) => l.unlock(),
            AnyLock::Clh(l) => l.unlock(),
            AnyLock::Native(l) => l.unlock(),
        }
    }
}

/// Data protected by a [`RawLock`].
pub struct Locked<T: ?Sized, L: RawLock = AnyLock> {
    lock: L,
    data: UnsafeCell<T>,
}

// The lock serialises all access to `data`.
unsafe impl<T: ?Sized + Send, L: RawLock> Send for Locked<T, L> {}
unsafe impl<T: ?Sized + Send, L: RawLock> Sync for Locked<T, L> {}

impl<T> Locked<T, AnyLock> {
    /// Protect `data` with a lock of the given kind.
    pub fn new(data: T, kind: LockKind) -> Self {
        Self::with_lock(data, kind.build())
    }
}

impl<T, L: RawLock> Locked<T, L> {
    /// Protect `data` with an already constructed lock.
    pub fn with_lock(data: T, lock: L) -> Self {
        Self {
            lock,
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the wrapper and return the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, L: RawLock> Locked<T, L> {
    /// Acquire the lock.
    pub fn lock(&self) -> LockedGuard<'_, T, L> {
        self.lock.lock();
        LockedGuard { owner: self }
    }

    /// Acquire the lock if it is uncontended.
    pub fn try_lock(&self) -> Option<LockedGuard<'_, T, L>>
    where
        L: TryLock,
    {
        if self.lock.try_lock() {
            Some(LockedGuard { owner: self })
        } else {
            None
        }
    }

    /// Mutable access without locking; exclusive borrow proves no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// The underlying lock.
    pub fn raw(&self) -> &L {
        &self.lock
    }
}

impl<T: Default, L: RawLock + Default> Default for Locked<T, L> {
    fn default() -> Self {
        Self::with_lock(T::default(), L::default())
    }
}

impl<T: ?Sized, L: RawLock> fmt::Debug for Locked<T, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locked").finish_non_exhaustive()
    }
}

/// RAII access to the data inside a [`Locked`]; unlocks on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockedGuard<'a, T: ?Sized, L: RawLock> {
    owner: &'a Locked<T, L>,
}

impl<T: ?Sized, L: RawLock> Deref for LockedGuard<'_, T, L> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held
        unsafe { &*self.owner.data.get() }
    }
}

impl<T: ?Sized, L: RawLock> DerefMut for LockedGuard<'_, T, L> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held, and `&mut self` makes it unique
        unsafe { &mut *self.owner.data.get() }
    }
}

impl<T: ?Sized, L: RawLock> Drop for LockedGuard<'_, T, L> {
    fn drop(&mut self) {
        // SAFETY: the guard was created by acquiring the lock
        unsafe { self.owner.lock.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const THREADS: usize = 4;
    const ITERATIONS: usize = 5_000;

    fn hammer(counter: Arc<Locked<usize>>) -> usize {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let total = *counter.lock();
        total
    }

    #[test]
    fn test_every_kind_counts_exactly() {
        let kinds = [
            LockKind::Tas,
            LockKind::Ttas,
            LockKind::Ticket,
            LockKind::Anderson { slots: THREADS },
            LockKind::Clh,
            LockKind::Native,
        ];
        for kind in kinds {
            let counter = Arc::new(Locked::new(0usize, kind));
            assert_eq!(hammer(counter), THREADS * ITERATIONS, "{:?}", kind);
        }
    }

    #[test]
    fn test_lock_kind_parsing() {
        assert_eq!("tas".parse::<LockKind>().unwrap(), LockKind::Tas);
        assert_eq!(" TTAS ".parse::<LockKind>().unwrap(), LockKind::Ttas);
        assert_eq!("mutex".parse::<LockKind>().unwrap(), LockKind::Native);
        assert_eq!(
            "anderson:8".parse::<LockKind>().unwrap(),
            LockKind::Anderson { slots: 8 }
        );
        assert!("anderson:0".parse::<LockKind>().is_err());
        assert!("spinny".parse::<LockKind>().is_err());
    }

    #[test]
    fn test_any_lock_reports_kind() {
        let lock = LockKind::Anderson { slots: 4 }.build();
        assert_eq!(lock.kind(), LockKind::Anderson { slots: 4 });
        assert_eq!(AnyLock::default().kind(), LockKind::Ttas);
    }

    #[test]
    fn test_try_lock_on_guard() {
        let locked = Locked::with_lock(vec![1, 2, 3], TasLock::new());
        let guard = locked.lock();
        assert!(locked.try_lock().is_none());
        drop(guard);
        let mut guard = locked.try_lock().expect("uncontended");
        guard.push(4);
        drop(guard);
        assert_eq!(locked.into_inner(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_backoff_spin_counts() {
        assert_eq!(Backoff::None.spins(10), 0);
        assert_eq!(Backoff::Exponential { max_exponent: 4 }.spins(2), 4);
        assert_eq!(Backoff::Exponential { max_exponent: 4 }.spins(9), 16);
        assert_eq!(Backoff::Linear { max_spins: 100 }.spins(30), 30);
        assert_eq!(Backoff::Linear { max_spins: 100 }.spins(300), 100);
        // Long waits pin the amount at its maximum.
        assert_eq!(Backoff::Exponential { max_exponent: 16 }.spins(u32::MAX), 1 << 16);
        assert_eq!(Backoff::Linear { max_spins: 100 }.spins(u32::MAX), 100);
    }
}
