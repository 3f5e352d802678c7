//! Worker threads
//!
//! Each scheduler runs on its own named OS thread, optionally pinned to one
//! CPU. A panic that escapes a scheduler leaves the runtime's bookkeeping
//! (live count, ownership, wake ring) in an unknown state, so it is logged
//! and the whole OS process is aborted.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::core::Scheduler;
use crate::error::{Error, Result};

/// Unique identifier for a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub usize);

impl WorkerId {
    /// Get the numeric ID
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Worker thread configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID
    pub id: WorkerId,
    /// Thread name
    pub name: String,
    /// CPU to pin the thread to
    pub cpu_affinity: Option<usize>,
}

/// OS thread running one scheduler.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    thread_handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker that is not running yet.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            thread_handle: None,
        }
    }

    /// Spawn the thread and run `scheduler` on it.
    pub fn start(&mut self, scheduler: Arc<Scheduler>) -> Result<()> {
        if self.thread_handle.is_some() {
            return Err(Error::RuntimeError {
                reason: format!("worker {} already started", self.config.id.0),
            });
        }

        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_main(config, scheduler))
            .map_err(|e| Error::SpawnError {
                reason: format!("{}: {}", self.config.name, e),
            })?;

        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Wait for the thread to finish.
    pub fn join(&mut self) -> Result<()> {
        if let Some(handle) = self.thread_handle.take() {
            handle.join().map_err(|_| Error::RuntimeError {
                reason: format!("worker {} panicked", self.config.name),
            })?;
        }
        Ok(())
    }

    /// Get worker ID
    pub fn id(&self) -> WorkerId {
        self.config.id
    }

    /// Whether the thread has been started and not joined.
    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }
}

fn worker_main(config: WorkerConfig, scheduler: Arc<Scheduler>) {
    if let Some(cpu) = config.cpu_affinity {
        if let Err(e) = set_cpu_affinity(cpu) {
            log::warn!("{}: could not bind to CPU {}: {}", config.name, cpu, e);
        }
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| scheduler.run()));
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        log::error!(
            "{}: scheduler {} panicked: {}; aborting",
            config.name,
            scheduler.id(),
            message
        );
        std::process::abort();
    }
}

/// Set CPU affinity for the current thread (Linux only)
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn set_cpu_affinity(cpu: usize) -> io::Result<()> {
    use libc::{cpu_set_t, sched_setaffinity, CPU_SET, CPU_SETSIZE, CPU_ZERO};
    use std::mem;

    if cpu >= CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("CPU {} out of range", cpu),
        ));
    }
    unsafe {
        let mut set: cpu_set_t = mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(cpu, &mut set);
        if sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Set CPU affinity for the current thread (no-op off Linux)
#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cpu: usize) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_creation() {
        let worker = Worker::new(WorkerConfig {
            id: WorkerId(1),
            name: "test-worker".to_string(),
            cpu_affinity: None,
        });
        assert_eq!(worker.id(), WorkerId(1));
        assert_eq!(worker.id().as_usize(), 1);
        assert!(!worker.is_running());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_affinity_rejects_out_of_range_cpu() {
        let result = thread::spawn(|| set_cpu_affinity(1 << 20)).join().unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }
}
