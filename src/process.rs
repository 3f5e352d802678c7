//! Processes and messages
//!
//! A [`Process`] is a cooperative actor: a named mailbox of [`Message`]s
//! that are run one at a time by whichever scheduler currently owns it. A
//! process with an empty mailbox has no owner and costs nothing; the next
//! enqueue hands it to a scheduler again.
//!
//! The runtime keeps a global count of live processes. Schedulers stop once
//! it reaches zero, so every process must eventually [`exit`](Process::exit)
//! or be dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::lock::{LockKind, Locked};
use crate::scheduler::{current_scheduler, Scheduler};

/// Number of processes created and not yet retired or dropped.
static LIVE: AtomicUsize = AtomicUsize::new(0);
static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// One deferred unit of work, run exactly once by its process.
pub trait Message: Send + 'static {
    /// Perform the work. Consumes the message.
    fn run(self: Box<Self>);
}

impl<F> Message for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

struct Mailbox {
    messages: VecDeque<Box<dyn Message>>,
    owner: Option<Arc<Scheduler>>,
}

/// Per-process scheduling counters.
#[derive(Debug, Default)]
struct ProcessCounters {
    messages_run: AtomicUsize,
    turns: AtomicUsize,
    peak_pending: AtomicUsize,
}

/// Snapshot of a process's scheduling statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    /// Messages executed so far
    pub messages_run: usize,
    /// Times a scheduler picked the process up
    pub turns: usize,
    /// Largest backlog seen at the start of a turn
    pub peak_pending: usize,
}

/// A cooperative actor with a FIFO mailbox.
pub struct Process {
    id: u64,
    name: String,
    mailbox: Locked<Mailbox>,
    exited: AtomicBool,
    retired: AtomicBool,
    counters: ProcessCounters,
}

impl Process {
    /// Create a process and count it as live.
    ///
    /// Inside a scheduler the mailbox lock follows the runtime's
    /// configuration; elsewhere it is the default kind.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let kind = current_scheduler()
            .map(|s| s.message_lock_kind())
            .unwrap_or_default();
        Self::with_lock(name, kind)
    }

    /// Create a process whose mailbox is guarded by a lock of `kind`.
    pub fn with_lock(name: impl Into<String>, kind: LockKind) -> Arc<Self> {
        LIVE.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            mailbox: Locked::new(
                Mailbox {
                    messages: VecDeque::new(),
                    owner: None,
                },
                kind,
            ),
            exited: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            counters: ProcessCounters::default(),
        })
    }

    /// Number of live processes in the OS process.
    pub fn live_count() -> usize {
        LIVE.load(Ordering::Acquire)
    }

    /// Queue `msg` and, if the process is idle, schedule it on the calling
    /// thread's scheduler.
    ///
    /// Outside any scheduler the message is only queued; the process runs
    /// once something hands it to a scheduler.
    ///
    /// # Panics
    ///
    /// Panics if the process has exited.
    pub fn enqueue_message<M: Message>(self: &Arc<Self>, msg: M) {
        let scheduler = current_scheduler();
        self.enqueue_message_on(msg, scheduler.as_ref());
    }

    /// Queue `msg` and, if the process is idle, schedule it on `scheduler`.
    ///
    /// # Panics
    ///
    /// Panics if the process has exited.
    pub fn enqueue_message_on<M: Message>(self: &Arc<Self>, msg: M, scheduler: Option<&Arc<Scheduler>>) {
        let mut mailbox = self.mailbox.lock();
        // Checked under the mailbox lock so it cannot interleave with `exit`.
        assert!(
            !self.has_exited(),
            "message enqueued on exited process {:?}",
            self.name
        );
        mailbox.messages.push_back(Box::new(msg));
        if mailbox.owner.is_none() {
            if let Some(scheduler) = scheduler {
                mailbox.owner = Some(Arc::clone(scheduler));
                scheduler.enqueue_process(Arc::clone(self));
            }
        }
    }

    /// Hand an idle process to `scheduler`. Does nothing if it already has
    /// an owner, since it is then queued or running somewhere.
    pub(crate) fn attach(self: &Arc<Self>, scheduler: &Arc<Scheduler>) {
        let mut mailbox = self.mailbox.lock();
        if mailbox.owner.is_none() {
            mailbox.owner = Some(Arc::clone(scheduler));
            scheduler.enqueue_process(Arc::clone(self));
        }
    }

    /// Mark the process finished. Its scheduler retires it after the
    /// current turn.
    ///
    /// # Panics
    ///
    /// Panics if messages are still pending.
    pub fn exit(&self) {
        let pending = {
            let mailbox = self.mailbox.lock();
            self.exited.store(true, Ordering::Release);
            mailbox.messages.len()
        };
        assert!(
            pending == 0,
            "process {:?} exited with {} pending messages",
            self.name,
            pending
        );
    }

    /// Whether [`exit`](Self::exit) has been called.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Whether any message is pending.
    pub fn is_runnable(&self) -> bool {
        !self.mailbox.lock().messages.is_empty()
    }

    /// Number of pending messages.
    pub fn pending_messages(&self) -> usize {
        self.mailbox.lock().messages.len()
    }

    /// Run the oldest pending message. Returns false if there was none.
    pub fn run_one_message(&self) -> bool {
        let next = self.mailbox.lock().messages.pop_front();
        match next {
            Some(msg) => {
                msg.run();
                self.counters.messages_run.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// After a turn: put the process back on its owner's run queue if it
    /// still has work, otherwise release the owner so any scheduler may
    /// pick it up next time.
    pub fn requeue_process(self: &Arc<Self>) {
        let mut mailbox = self.mailbox.lock();
        if mailbox.messages.is_empty() {
            mailbox.owner = None;
            return;
        }
        match mailbox.owner.clone() {
            Some(owner) => owner.enqueue_process(Arc::clone(self)),
            None => {
                // Nobody owns it; fall back to the calling thread's scheduler.
                if let Some(scheduler) = current_scheduler() {
                    scheduler.enqueue_process(Arc::clone(self));
                    mailbox.owner = Some(scheduler);
                }
            }
        }
    }

    /// The scheduler currently responsible for this process.
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.mailbox.lock().owner.clone()
    }

    /// Change the owning scheduler. Only schedulers should call this.
    pub(crate) fn set_owner(&self, owner: Option<Arc<Scheduler>>) {
        self.mailbox.lock().owner = owner;
    }

    /// Whether the calling thread's scheduler is running this process.
    pub fn is_in_process_context(&self) -> bool {
        current_scheduler()
            .and_then(|s| s.current_process())
            .map_or(false, |p| p.id == self.id)
    }

    /// Human-readable name.
    pub fn process_name(&self) -> &str {
        &self.name
    }

    /// Unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ProcessStats {
        ProcessStats {
            messages_run: self.counters.messages_run.load(Ordering::Relaxed),
            turns: self.counters.turns.load(Ordering::Relaxed),
            peak_pending: self.counters.peak_pending.load(Ordering::Relaxed),
        }
    }

    /// Record the start of a scheduling turn.
    pub(crate) fn begin_turn(&self) {
        self.counters.turns.fetch_add(1, Ordering::Relaxed);
        self.counters
            .peak_pending
            .fetch_max(self.pending_messages(), Ordering::Relaxed);
    }

    /// Release the scheduler and leave the live count. Returns the number
    /// of live processes remaining.
    pub(crate) fn retire(&self) -> usize {
        self.set_owner(None);
        if self.retired.swap(true, Ordering::AcqRel) {
            return LIVE.load(Ordering::Acquire);
        }
        self.leave_live_count()
    }

    /// Drop out of the live count, waking every running scheduler if this
    /// was the last live process. Returns the number remaining.
    fn leave_live_count(&self) -> usize {
        let remaining = LIVE.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            log::debug!(
                "last process {} ({:?}) gone, waking schedulers",
                self.id,
                self.name
            );
            Scheduler::wake_running();
        }
        remaining
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if !*self.retired.get_mut() {
            self.leave_live_count();
        }
        let stats = self.stats();
        log::debug!(
            "process {} ({:?}) dropped: {} messages in {} turns, peak backlog {}",
            self.id,
            self.name,
            stats.messages_run,
            stats.turns,
            stats.peak_pending
        );
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("exited", &self.has_exited())
            .field("pending", &self.pending_messages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_new_process_is_idle() {
        let _guard = crate::testing::serial();
        let process = Process::new("idle");
        assert!(!process.is_runnable());
        assert!(!process.has_exited());
        assert_eq!(process.pending_messages(), 0);
        assert_eq!(process.process_name(), "idle");
        assert!(process.scheduler().is_none());
        assert!(!process.run_one_message());
    }

    #[test]
    fn test_messages_run_in_order() {
        let _guard = crate::testing::serial();
        let process = Process::new("ordered");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = Arc::clone(&seen);
            process.enqueue_message(move || seen.lock().push(i));
        }
        assert!(process.is_runnable());
        assert_eq!(process.pending_messages(), 5);

        for _ in 0..5 {
            assert!(process.run_one_message());
        }
        assert!(!process.run_one_message());
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(process.stats().messages_run, 5);
    }

    #[test]
    fn test_live_count_tracks_drop_and_retire() {
        let _guard = crate::testing::serial();
        let before = Process::live_count();
        let dropped = Process::new("dropped");
        let retired = Process::new("retired");
        assert_eq!(Process::live_count(), before + 2);

        drop(dropped);
        assert_eq!(Process::live_count(), before + 1);

        retired.exit();
        assert_eq!(retired.retire(), before);
        // A second retire or the final drop must not count again.
        assert_eq!(retired.retire(), before);
        drop(retired);
        assert_eq!(Process::live_count(), before);
    }

    #[test]
    fn test_enqueue_racing_exit_never_strands_a_message() {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        use std::thread;

        let _guard = crate::testing::serial();
        for _ in 0..20 {
            let process = Process::new("racing");
            let sender = {
                let process = Arc::clone(&process);
                thread::spawn(move || {
                    let mut accepted = 0;
                    while catch_unwind(AssertUnwindSafe(|| process.enqueue_message(|| {}))).is_ok() {
                        accepted += 1;
                    }
                    accepted
                })
            };

            let mut ran = 0;
            loop {
                while process.run_one_message() {
                    ran += 1;
                }
                // Exit fails while a message slipped in; drain and retry.
                if catch_unwind(AssertUnwindSafe(|| process.exit())).is_ok() {
                    break;
                }
            }
            let accepted = sender.join().unwrap();
            assert!(process.has_exited());
            assert_eq!(process.pending_messages(), 0);
            assert_eq!(ran, accepted);
        }
    }

    #[test]
    fn test_enqueue_on_scheduler_assigns_owner_once() {
        let _guard = crate::testing::serial();
        let scheduler = Scheduler::new().unwrap();
        let process = Process::new("owned");

        process.enqueue_message_on(|| {}, Some(&scheduler));
        process.enqueue_message_on(|| {}, Some(&scheduler));
        assert_eq!(process.scheduler().map(|s| s.id()), Some(scheduler.id()));

        // Only the idle-to-runnable transition queues the process.
        let queued = scheduler.next_process().unwrap();
        assert_eq!(queued.id(), process.id());
        assert!(scheduler.next_process().is_none());

        while process.run_one_message() {}
        process.requeue_process();
        assert!(process.scheduler().is_none());
    }

    #[test]
    fn test_requeue_keeps_runnable_process() {
        let _guard = crate::testing::serial();
        let scheduler = Scheduler::new().unwrap();
        let process = Process::new("busy");

        process.enqueue_message_on(|| {}, Some(&scheduler));
        process.enqueue_message_on(|| {}, Some(&scheduler));
        let queued = scheduler.next_process().unwrap();
        assert!(queued.run_one_message());

        queued.requeue_process();
        assert_eq!(scheduler.next_process().map(|p| p.id()), Some(process.id()));
        assert!(process.scheduler().is_some());
        process.set_owner(None);
    }

    #[test]
    #[should_panic(expected = "exited process")]
    fn test_enqueue_after_exit_panics() {
        let _guard = crate::testing::serial();
        let process = Process::new("gone");
        process.exit();
        process.enqueue_message(|| {});
    }

    #[test]
    #[should_panic(expected = "pending messages")]
    fn test_exit_with_pending_messages_panics() {
        let _guard = crate::testing::serial();
        let process = Process::new("busy");
        process.enqueue_message(|| {});
        process.exit();
    }

    #[test]
    fn test_custom_message_type() {
        struct Add(Arc<AtomicUsize>, usize);
        impl Message for Add {
            fn run(self: Box<Self>) {
                self.0.fetch_add(self.1, Ordering::SeqCst);
            }
        }

        let _guard = crate::testing::serial();
        let total = Arc::new(AtomicUsize::new(0));
        let process = Process::with_lock("adder", LockKind::Ticket);
        process.enqueue_message(Add(Arc::clone(&total), 3));
        process.enqueue_message(Add(Arc::clone(&total), 4));
        while process.run_one_message() {}
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }
}
