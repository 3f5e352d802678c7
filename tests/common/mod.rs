//! Common test harness for libtask integration tests
//!
//! The live process count, the fd watcher and the scheduler pool are
//! process-wide, so every test that starts schedulers or creates processes
//! holds the serial guard for its whole body.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libtask::{Process, Scheduler, SchedulerConfig};
use parking_lot::{Mutex, MutexGuard};

static SERIAL: Mutex<()> = Mutex::new(());

/// Serialise tests that touch process-wide runtime state.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// A small pool that does not pin threads, suitable for CI machines.
pub fn test_config(num_threads: usize) -> SchedulerConfig {
    SchedulerConfig {
        num_threads,
        bind_to_cpu: false,
        use_topology: false,
        ..SchedulerConfig::default()
    }
}

/// Run `initial` to completion and check that nothing is left alive.
pub fn run_to_completion(config: &SchedulerConfig, initial: Arc<Process>) {
    Scheduler::start_with_config(config, initial).expect("schedulers failed to start");
    assert_eq!(Process::live_count(), 0, "processes still live after shutdown");
}

/// Shared counter handed to messages.
pub fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// Current value of a shared counter.
pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}
