//! Typed actors
//!
//! [`Actor<S>`] pairs a [`Process`] with private state `S`. Messages are
//! closures that get the state and a handle to the actor itself, which is
//! what most process implementations want: keep some fields, react to
//! messages, send further messages, exit when done.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::process::Process;
use crate::scheduler::Scheduler;

/// A process with private state. Handles are cheap to clone.
pub struct Actor<S> {
    process: Arc<Process>,
    state: Arc<Mutex<S>>,
}

impl<S> Clone for Actor<S> {
    fn clone(&self) -> Self {
        Self {
            process: Arc::clone(&self.process),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Send + 'static> Actor<S> {
    /// Create an actor with initial `state`.
    pub fn new(name: impl Into<String>, state: S) -> Self {
        Self {
            process: Process::new(name),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Send `f` to the actor, scheduling it on the calling thread's
    /// scheduler if it is idle.
    ///
    /// `f` must not call [`Actor::with_state`] on the same actor; the state
    /// is already borrowed.
    pub fn tell<F>(&self, f: F)
    where
        F: FnOnce(&mut S, &Actor<S>) + Send + 'static,
    {
        let me = self.clone();
        self.process.enqueue_message(move || {
            let mut state = me.state.lock();
            f(&mut state, &me);
        });
    }

    /// Like [`tell`](Self::tell) but schedules an idle actor on `scheduler`.
    pub fn tell_on<F>(&self, f: F, scheduler: Option<&Arc<Scheduler>>)
    where
        F: FnOnce(&mut S, &Actor<S>) + Send + 'static,
    {
        let me = self.clone();
        self.process.enqueue_message_on(
            move || {
                let mut state = me.state.lock();
                f(&mut state, &me);
            },
            scheduler,
        );
    }

    /// Read or modify the state from outside a message.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Exit the underlying process. See [`Process::exit`].
    pub fn exit(&self) {
        self.process.exit();
    }

    /// The underlying process.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }
}

impl<S> fmt::Debug for Actor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Actor").field(&self.process).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_state_and_self_messages() {
        let _guard = crate::testing::serial();
        let counter = Actor::new("counter", 0u32);

        counter.tell(|count, me| {
            *count += 1;
            me.tell(|count, _| *count += 10);
        });
        assert!(counter.process().run_one_message());
        assert_eq!(counter.with_state(|c| *c), 1);

        assert!(counter.process().run_one_message());
        assert_eq!(counter.with_state(|c| *c), 11);
        assert!(!counter.process().run_one_message());

        counter.tell(|_, me| me.exit());
        counter.process().run_one_message();
        assert!(counter.process().has_exited());
    }
}
