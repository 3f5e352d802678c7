//! # libtask
//!
//! A cooperative actor runtime: lightweight processes that react to queued
//! messages, multiplexed over a fixed pool of OS threads by a work-stealing
//! scheduler.
//!
//! ## Features
//!
//! - **Processes**: actors with a FIFO mailbox, run one message at a time
//! - **Scheduler**: one per thread, quota-limited turns, ring-ordered work
//!   stealing and eventfd wakeups
//! - **FD watcher**: one-shot readiness callbacks for blocking descriptors
//! - **Locks**: six interchangeable mutual-exclusion strategies
//! - **FIFO list**: lock-free intrusive multi-producer multi-consumer queue
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use libtask::prelude::*;
//! use std::sync::Arc;
//!
//! let hello = Process::new("hello");
//! let me = Arc::clone(&hello);
//! hello.enqueue_message(move || {
//!     println!("hello from {}", me.process_name());
//!     me.exit();
//! });
//! Scheduler::start_schedulers(2, hello, false).unwrap();
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod actor;
pub mod error;
pub mod fifo;
pub mod io;
pub mod lock;
pub mod process;
pub mod scheduler;
pub mod semaphore;
pub mod topology;

/// Convenient re-exports for common functionality
pub mod prelude {
    pub use crate::actor::Actor;
    pub use crate::error::{Error, Result};
    pub use crate::fifo::{FifoList, FifoNode};
    pub use crate::io::{fd_watcher, Events};
    pub use crate::lock::{LockKind, Locked};
    pub use crate::process::{Message, Process};
    pub use crate::scheduler::{current_scheduler, Scheduler, SchedulerConfig};
    pub use crate::semaphore::{BlockingSemaphore, Semaphore, SpinSemaphore};
}

// Re-export the prelude at crate root for convenience
pub use prelude::*;

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::{Mutex, MutexGuard};

    static SERIAL: Mutex<()> = Mutex::new(());

    /// Held by every unit test that creates processes or touches other
    /// process-wide state.
    pub(crate) fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock()
    }
}
