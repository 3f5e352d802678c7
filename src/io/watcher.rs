//! Descriptor readiness watcher
//!
//! [`FdWatcher`] turns readiness of ordinary file descriptors into one-shot
//! callbacks. Registrations live in a map behind a runtime lock; the
//! designated fd scheduler polls them from its idle loop, so a process that
//! wants to wait for I/O registers a callback that enqueues a message and
//! simply goes idle.
//!
//! The watcher is a process-wide singleton obtained with [`fd_watcher`]. It
//! is created on first use and dropped by [`shutdown_fd_watcher`] once the
//! schedulers have stopped.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;

use super::EventFd;
use crate::error::Result;
use crate::lock::{LockKind, Locked};

/// Set of readiness conditions on a descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Events(u8);

impl Events {
    /// No event
    pub const NONE: Events = Events(0x00);
    /// Descriptor is readable (or hung up)
    pub const READ: Events = Events(0x01);
    /// Descriptor is writable
    pub const WRITE: Events = Events(0x02);
    /// Error or exceptional condition on the descriptor
    pub const ERROR: Events = Events(0x04);

    /// Whether every event in `other` is also in `self`.
    pub const fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the set is empty.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    fn to_poll(self) -> libc::c_short {
        let mut poll = 0;
        if self.contains(Events::READ) {
            poll |= libc::POLLIN;
        }
        if self.contains(Events::WRITE) {
            poll |= libc::POLLOUT;
        }
        if self.contains(Events::ERROR) {
            poll |= libc::POLLPRI;
        }
        poll
    }

    fn from_poll(revents: libc::c_short) -> Events {
        let mut events = Events::NONE;
        if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            events |= Events::READ;
        }
        if revents & libc::POLLOUT != 0 {
            events |= Events::WRITE;
        }
        if revents & (libc::POLLPRI | libc::POLLERR | libc::POLLNVAL) != 0 {
            events |= Events::ERROR;
        }
        events
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Events {
    type Output = Events;

    fn bitand(self, rhs: Events) -> Events {
        Events(self.0 & rhs.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Events::READ, "READ"),
            (Events::WRITE, "WRITE"),
            (Events::ERROR, "ERROR"),
        ]
        .iter()
        .filter(|(e, _)| self.contains(*e))
        .map(|(_, name)| *name)
        .collect();
        if names.is_empty() {
            write!(f, "Events(NONE)")
        } else {
            write!(f, "Events({})", names.join(" | "))
        }
    }
}

/// Events from `revents` that a registration for `interest` gets to see.
/// Errors are always reported and a hang-up satisfies any interest.
fn deliverable(interest: Events, revents: libc::c_short) -> Events {
    let mut ready = Events::from_poll(revents) & (interest | Events::ERROR);
    if revents & libc::POLLHUP != 0 {
        ready |= interest;
    }
    ready
}

/// One-shot readiness callback.
pub type FdCallback = Box<dyn FnOnce(RawFd, Events) + Send + 'static>;

struct FdEvent {
    interest: Events,
    callback: FdCallback,
}

/// Registry of one-shot descriptor callbacks.
pub struct FdWatcher {
    events: Locked<BTreeMap<RawFd, FdEvent>>,
    change: EventFd,
}

impl FdWatcher {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            events: Locked::new(BTreeMap::new(), LockKind::Native),
            change: EventFd::new()?,
        })
    }

    /// Invoke `callback` once `fd` is ready for any of `events`.
    ///
    /// The registration is removed before the callback runs; register again
    /// to keep watching. A later registration for the same descriptor
    /// replaces an earlier one. The descriptor should be non-blocking.
    /// Invalid or failed descriptors fire with [`Events::ERROR`].
    pub fn register_fd_callback<F>(&self, fd: RawFd, events: Events, callback: F)
    where
        F: FnOnce(RawFd, Events) + Send + 'static,
    {
        let previous = self.events.lock().insert(
            fd,
            FdEvent {
                interest: events,
                callback: Box::new(callback),
            },
        );
        if previous.is_some() {
            log::debug!("fd {} re-registered, dropping previous callback", fd);
        }
        self.change.signal();
    }

    /// Remove the registration for `fd` without invoking it.
    ///
    /// Returns whether a registration existed.
    pub fn clear_fd_callback(&self, fd: RawFd) -> bool {
        let removed = self.events.lock().remove(&fd);
        match removed {
            Some(_) => {
                self.change.signal();
                true
            }
            None => false,
        }
    }

    /// Number of descriptors currently watched.
    pub fn registered(&self) -> usize {
        self.events.lock().len()
    }

    /// Poll every registration plus `sched` and the change descriptor.
    ///
    /// With `block` the call waits without timeout for something to become
    /// ready; otherwise it checks once and returns, skipping the system call
    /// altogether when nothing is registered. Ready registrations are
    /// removed and their callbacks run on this thread before returning.
    /// Returns the number of callbacks run.
    pub(crate) fn wait_fds(&self, sched: &EventFd, block: bool) -> usize {
        let mut pollfds: Vec<libc::pollfd> = {
            let events = self.events.lock();
            events
                .iter()
                .map(|(&fd, event)| libc::pollfd {
                    fd,
                    events: event.interest.to_poll(),
                    revents: 0,
                })
                .collect()
        };
        let registered = pollfds.len();
        if !block && registered == 0 {
            return 0;
        }
        for fd in [sched.as_raw_fd(), self.change.as_raw_fd()] {
            pollfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let timeout = if block { -1 } else { 0 };
        let ready = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout,
            )
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!("poll on {} descriptors failed: {}", pollfds.len(), err);
            }
            return 0;
        }
        if ready == 0 {
            return 0;
        }

        let fired: Vec<(RawFd, Events, FdCallback)> = {
            let mut events = self.events.lock();
            pollfds[..registered]
                .iter()
                .filter_map(|pfd| {
                    // The registration may have been replaced since the
                    // snapshot; only deliver what the current one asked for.
                    let ready = deliverable(events.get(&pfd.fd)?.interest, pfd.revents);
                    if ready.is_empty() {
                        return None;
                    }
                    events
                        .remove(&pfd.fd)
                        .map(|event| (pfd.fd, ready, event.callback))
                })
                .collect()
        };
        let count = fired.len();
        for (fd, ready, callback) in fired {
            callback(fd, ready);
        }

        if pollfds[registered].revents != 0 {
            sched.drain();
        }
        if pollfds[registered + 1].revents != 0 {
            self.change.drain();
        }
        count
    }
}

impl fmt::Debug for FdWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdWatcher")
            .field("registered", &self.registered())
            .field("change_fd", &self.change.as_raw_fd())
            .finish()
    }
}

static FD_WATCHER: Mutex<Option<Arc<FdWatcher>>> = Mutex::new(None);

/// The process-wide watcher, created on first use.
pub fn fd_watcher() -> Result<Arc<FdWatcher>> {
    let mut slot = FD_WATCHER.lock();
    if let Some(watcher) = slot.as_ref() {
        return Ok(Arc::clone(watcher));
    }
    let watcher = Arc::new(FdWatcher::new()?);
    log::debug!("fd watcher created (change fd {})", watcher.change.as_raw_fd());
    *slot = Some(Arc::clone(&watcher));
    Ok(watcher)
}

/// Drop the process-wide watcher and any registrations still pending.
///
/// Handles obtained earlier stay valid but are no longer polled; the next
/// call to [`fd_watcher`] creates a fresh instance.
pub fn shutdown_fd_watcher() {
    if let Some(watcher) = FD_WATCHER.lock().take() {
        let pending = watcher.registered();
        if pending > 0 {
            log::debug!("fd watcher shut down with {} registrations pending", pending);
        }
    }
}
