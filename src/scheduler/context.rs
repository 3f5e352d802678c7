//! Per-thread scheduler context
//!
//! Each worker thread records the scheduler it is running and whether it is
//! a scheduler thread at all. [`Scheduler::run`] installs both for the
//! duration of the run and restores the previous values when it returns,
//! including on unwind.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use super::core::Scheduler;

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = const { RefCell::new(None) };
    static IN_SCHEDULER_CONTEXT: Cell<bool> = const { Cell::new(false) };
}

/// The scheduler running on this thread, if any.
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Replace this thread's current scheduler, returning the previous one.
///
/// Mainly for tests; worker threads get theirs from [`Scheduler::run`].
pub fn set_current_scheduler(scheduler: Option<Arc<Scheduler>>) -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER
        .try_with(|current| current.replace(scheduler))
        .ok()
        .flatten()
}

/// Whether this thread is a scheduler worker.
pub fn is_in_scheduler_context() -> bool {
    IN_SCHEDULER_CONTEXT
        .try_with(|flag| flag.get())
        .unwrap_or(false)
}

/// Mark this thread as a scheduler worker (or not), returning the previous
/// value.
pub fn set_in_scheduler_context(value: bool) -> bool {
    IN_SCHEDULER_CONTEXT
        .try_with(|flag| flag.replace(value))
        .unwrap_or(false)
}

/// Installs a scheduler as the thread's context until dropped.
pub(crate) struct ContextGuard {
    previous: Option<Arc<Scheduler>>,
    was_in_context: bool,
}

impl ContextGuard {
    pub(crate) fn install(scheduler: Arc<Scheduler>) -> Self {
        Self {
            previous: set_current_scheduler(Some(scheduler)),
            was_in_context: set_in_scheduler_context(true),
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        set_current_scheduler(self.previous.take());
        set_in_scheduler_context(self.was_in_context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults_to_none() {
        assert!(current_scheduler().is_none());
        assert!(!is_in_scheduler_context());
    }

    #[test]
    fn test_guard_restores_previous_context() {
        let outer = Scheduler::new().unwrap();
        let inner = Scheduler::new().unwrap();

        set_current_scheduler(Some(Arc::clone(&outer)));
        {
            let _guard = ContextGuard::install(Arc::clone(&inner));
            assert_eq!(current_scheduler().map(|s| s.id()), Some(inner.id()));
            assert!(is_in_scheduler_context());
        }
        assert_eq!(current_scheduler().map(|s| s.id()), Some(outer.id()));
        assert!(!is_in_scheduler_context());

        set_current_scheduler(None);
        assert!(current_scheduler().is_none());
    }
}
