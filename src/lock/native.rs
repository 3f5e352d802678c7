//! The platform's blocking mutex behind the [`RawLock`] interface

use parking_lot::lock_api::RawMutex as _;

use super::{RawLock, TryLock};

/// A blocking mutex that parks waiters instead of spinning.
///
/// Dropping it while held is a usage error and panics.
pub struct NativeMutex {
    raw: parking_lot::RawMutex,
}

impl NativeMutex {
    /// Create an unlocked mutex.
    pub const fn new() -> Self {
        Self {
            raw: parking_lot::RawMutex::INIT,
        }
    }
}

impl Default for NativeMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NativeMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeMutex")
            .field("locked", &self.raw.is_locked())
            .finish()
    }
}

impl RawLock for NativeMutex {
    #[inline]
    fn lock(&self) {
        self.raw.lock();
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.raw.unlock();
    }
}

impl TryLock for NativeMutex {
    #[inline]
    fn try_lock(&self) -> bool {
        self.raw.try_lock()
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl Drop for NativeMutex {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(!self.raw.is_locked(), "NativeMutex dropped while locked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_mutex_states() {
        let mutex = NativeMutex::new();
        assert!(!mutex.is_locked());
        mutex.lock();
        assert!(mutex.is_locked());
        assert!(!mutex.try_lock());
        unsafe { mutex.unlock() };
        assert!(mutex.try_lock());
        unsafe { mutex.unlock() };
        assert!(!mutex.is_locked());
    }

    #[test]
    #[should_panic(expected = "dropped while locked")]
    fn test_drop_while_locked_panics() {
        let mutex = NativeMutex::new();
        mutex.lock();
        drop(mutex);
    }
}
