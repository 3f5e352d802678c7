//! Wake descriptors
//!
//! A thin owner of a non-blocking Linux eventfd. Schedulers use one each to
//! wake peers in their ring, and the fd watcher uses one to interrupt a
//! blocking poll when its registration set changes.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

/// A counter descriptor that becomes readable once signalled.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Create a new, unsignalled descriptor.
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::wake("eventfd", io::Error::last_os_error()));
        }
        // SAFETY: eventfd returned a fresh descriptor that nothing else owns
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Make the descriptor readable, waking one blocked reader.
    pub fn signal(&self) {
        let val: u64 = 1;
        loop {
            let ret = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    &val as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // Counter saturated: it is already readable.
                Some(libc::EAGAIN) => return,
                _ => {
                    log::warn!(
                        "eventfd {} signal failed: {}",
                        self.fd.as_raw_fd(),
                        io::Error::last_os_error()
                    );
                    return;
                }
            }
        }
    }

    /// Reset the counter. Returns whether it had been signalled.
    pub fn drain(&self) -> bool {
        let mut val: u64 = 0;
        loop {
            let ret = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut val as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                return true;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return false;
            }
        }
    }

    /// Block until signalled, then reset the counter.
    pub fn wait(&self) {
        while !self.drain() {
            let mut pfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            // EINTR just loops back to the drain attempt.
            unsafe { libc::poll(&mut pfd, 1, -1) };
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_drain_reports_signal() {
        let efd = EventFd::new().unwrap();
        assert!(!efd.drain());
        efd.signal();
        efd.signal();
        assert!(efd.drain());
        assert!(!efd.drain());
    }

    #[test]
    fn test_wait_wakes_on_signal() {
        let efd = Arc::new(EventFd::new().unwrap());
        let efd_clone = Arc::clone(&efd);
        let waiter = thread::spawn(move || efd_clone.wait());

        thread::sleep(Duration::from_millis(20));
        efd.signal();
        waiter.join().unwrap();
        assert!(!efd.drain());
    }
}
