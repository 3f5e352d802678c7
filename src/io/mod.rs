//! Blocking I/O integration
//!
//! Wake descriptors used by the schedulers and the fd watcher that turns
//! descriptor readiness into one-shot callbacks run from the fd scheduler's
//! idle loop.

#![allow(unsafe_code)] // eventfd, poll and read/write go through libc

mod eventfd;
mod watcher;

pub use eventfd::EventFd;
pub use watcher::{fd_watcher, shutdown_fd_watcher, Events, FdCallback, FdWatcher};
