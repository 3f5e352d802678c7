//! Scheduler core
//!
//! One [`Scheduler`] per worker thread. Each owns a run queue of runnable
//! processes and gives every process it picks a turn of at most `quota`
//! messages. When its own queue is empty it probes its steal ring, and when
//! the whole ring is empty it sleeps on its neighbour's wake descriptor.
//!
//! Wake signals travel backwards around the ring: enqueueing onto an empty
//! run queue signals that scheduler's descriptor, which wakes the peer that
//! sleeps on it. A scheduler that slept and then found work signals its own
//! descriptor in turn, so idle peers keep getting pulled in while there is
//! work to share. Scheduler 0 is the fd scheduler: it sleeps inside the fd
//! watcher's poll instead, with its neighbour's descriptor in the set, and
//! also polls registrations without blocking before each probe round.
//!
//! The run loops stop once the global live process count reaches zero.
//! Every scheduler inside [`Scheduler::run`] is listed in a process-wide
//! registry, and whichever thread retires or drops the last process signals
//! all of them, so no peer stays asleep after the work is gone.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::context::ContextGuard;
use super::queue::RunQueue;
use super::steal::StealPlan;
use super::worker::{Worker, WorkerConfig, WorkerId};
use crate::error::{Error, Result};
use crate::io::{fd_watcher, shutdown_fd_watcher, EventFd, FdWatcher};
use crate::lock::LockKind;
use crate::process::Process;
use crate::topology::Topology;

/// Messages a process may run per turn by default.
pub const DEFAULT_QUOTA: usize = 100;

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(0);

/// Schedulers currently inside `run`.
static RUNNING: Mutex<Vec<Weak<Scheduler>>> = Mutex::new(Vec::new());

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of scheduler threads
    pub num_threads: usize,
    /// Pin each scheduler thread to one CPU
    pub bind_to_cpu: bool,
    /// Maximum messages run per process turn
    pub quota: usize,
    /// Thread name prefix
    pub thread_name_prefix: String,
    /// Lock protecting each run queue
    pub run_queue_lock: LockKind,
    /// Lock protecting the mailboxes of processes created on scheduler threads
    pub message_queue_lock: LockKind,
    /// Order steal rings by CPU topology when it can be read
    pub use_topology: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            bind_to_cpu: cfg!(target_os = "linux"),
            quota: DEFAULT_QUOTA,
            thread_name_prefix: "libtask-sched".to_string(),
            run_queue_lock: LockKind::default(),
            message_queue_lock: LockKind::default(),
            use_topology: cfg!(target_os = "linux"),
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `LIBTASK_THREADS`, `LIBTASK_QUOTA`,
    /// `LIBTASK_BIND_CPU` and `LIBTASK_LOCK` (applied to both queue locks).
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(threads) = env_value("LIBTASK_THREADS")? {
            config.num_threads = threads;
        }
        if let Some(quota) = env_value("LIBTASK_QUOTA")? {
            config.quota = quota;
        }
        if let Some(bind) = env_value::<Switch>("LIBTASK_BIND_CPU")? {
            config.bind_to_cpu = bind.0;
        }
        if let Some(kind) = env_value::<LockKind>("LIBTASK_LOCK")? {
            config.run_queue_lock = kind;
            config.message_queue_lock = kind;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can run.
    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::ConfigError {
                reason: "num_threads must be at least 1".to_string(),
            });
        }
        if self.quota == 0 {
            return Err(Error::ConfigError {
                reason: "quota must be at least 1".to_string(),
            });
        }
        // Every scheduler plus one outside thread may contend for a queue.
        for (what, kind) in [
            ("run_queue_lock", self.run_queue_lock),
            ("message_queue_lock", self.message_queue_lock),
        ] {
            if let LockKind::Anderson { slots } = kind {
                if slots <= self.num_threads {
                    return Err(Error::ConfigError {
                        reason: format!(
                            "{} has {} Anderson slots, needs more than {} threads",
                            what, slots, self.num_threads
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    fn steal_plan(&self) -> StealPlan {
        let topology_plan = if self.use_topology {
            Topology::system().and_then(|t| StealPlan::from_topology(self.num_threads, t))
        } else {
            None
        };
        topology_plan.unwrap_or_else(|| StealPlan::round_robin(self.num_threads, num_cpus::get()))
    }
}

/// Boolean environment switch.
struct Switch(bool);

impl FromStr for Switch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Switch(true)),
            "0" | "false" | "no" | "off" => Ok(Switch(false)),
            other => Err(Error::ConfigError {
                reason: format!("expected a boolean, got {:?}", other),
            }),
        }
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|e| Error::ConfigError {
            reason: format!("{}={:?}: {}", name, raw, e),
        }),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Default)]
struct Counters {
    local: AtomicUsize,
    steals: AtomicUsize,
    messages: AtomicUsize,
    sleeps: AtomicUsize,
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Turns given to processes taken from the local run queue
    pub local: usize,
    /// Turns given to processes taken from a peer
    pub steals: usize,
    /// Messages run
    pub messages: usize,
    /// Times the scheduler went to sleep waiting for work
    pub sleeps: usize,
}

impl SchedulerStats {
    /// Total turns.
    pub fn processes(&self) -> usize {
        self.local + self.steals
    }

    /// Percentage of turns that did not need a steal.
    pub fn local_percent(&self) -> f64 {
        match self.processes() {
            0 => 0.0,
            total => 100.0 * self.local as f64 / total as f64,
        }
    }
}

/// A cooperative scheduler bound to one thread.
pub struct Scheduler {
    id: usize,
    run_queue: RunQueue<Arc<Process>>,
    wake: EventFd,
    steal_list: RwLock<Vec<Arc<Scheduler>>>,
    fd_role: AtomicBool,
    stopping: AtomicBool,
    current: Mutex<Option<Arc<Process>>>,
    quota: usize,
    message_lock: LockKind,
    counters: Counters,
}

impl Scheduler {
    /// Create a standalone scheduler with default settings.
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(&SchedulerConfig::default())
    }

    /// Create a standalone scheduler. Only the per-scheduler settings of
    /// `config` apply.
    pub fn with_config(config: &SchedulerConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            run_queue: RunQueue::new(config.run_queue_lock),
            wake: EventFd::new()?,
            steal_list: RwLock::new(Vec::new()),
            fd_role: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            current: Mutex::new(None),
            quota: config.quota.max(1),
            message_lock: config.message_queue_lock,
            counters: Counters::default(),
        }))
    }

    /// Run `initial` on `num` scheduler threads until every process has
    /// exited, with defaults for everything else.
    pub fn start_schedulers(num: usize, initial: Arc<Process>, bind_to_cpu: bool) -> Result<()> {
        let config = SchedulerConfig {
            num_threads: num,
            bind_to_cpu,
            ..SchedulerConfig::default()
        };
        Self::start_with_config(&config, initial)
    }

    /// Run `initial` on a pool built from `config` until every process has
    /// exited.
    ///
    /// Blocks until all scheduler threads have been joined. The fd watcher
    /// singleton is torn down before returning.
    pub fn start_with_config(config: &SchedulerConfig, initial: Arc<Process>) -> Result<()> {
        config.validate()?;
        fd_watcher()?;

        let num = config.num_threads;
        let schedulers = (0..num)
            .map(|_| Self::with_config(config))
            .collect::<Result<Vec<_>>>()?;
        let plan = config.steal_plan();
        for (i, scheduler) in schedulers.iter().enumerate() {
            let ring = plan
                .ring(i)
                .iter()
                .map(|&peer| Arc::clone(&schedulers[peer]))
                .collect();
            scheduler.set_steal_list(ring);
        }
        schedulers[0].fd_role.store(true, Ordering::Release);

        log::info!(
            "starting {} schedulers (quota {}, run queue lock {:?}, bind {})",
            num,
            config.quota,
            config.run_queue_lock,
            config.bind_to_cpu
        );

        let mut workers = Vec::with_capacity(num);
        let mut spawn_error = None;
        for (i, scheduler) in schedulers.iter().enumerate() {
            let mut worker = Worker::new(WorkerConfig {
                id: WorkerId(i),
                name: format!("{}-{}", config.thread_name_prefix, i),
                cpu_affinity: config.bind_to_cpu.then(|| plan.cpu(i)),
            });
            if let Err(e) = worker.start(Arc::clone(scheduler)) {
                spawn_error = Some(e);
                break;
            }
            workers.push(worker);
        }

        match &spawn_error {
            None => initial.attach(&schedulers[0]),
            Some(e) => {
                log::error!("stopping schedulers after spawn failure: {}", e);
                for scheduler in &schedulers {
                    scheduler.stop();
                }
            }
        }

        for worker in &mut workers {
            if let Err(e) = worker.join() {
                log::error!("{}", e);
            }
        }
        for scheduler in &schedulers {
            scheduler.log_stats();
            scheduler.set_steal_list(Vec::new());
        }
        shutdown_fd_watcher();
        log::info!("schedulers stopped, {} processes live", Process::live_count());

        match spawn_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of online processors.
    pub fn num_processors() -> usize {
        num_cpus::get()
    }

    /// Unique scheduler id.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Set the ring of peers to probe when idle. The first entry is the
    /// neighbour whose wake descriptor this scheduler sleeps on; the list
    /// should end with the scheduler itself. An empty list means only
    /// itself.
    pub fn set_steal_list(&self, list: Vec<Arc<Scheduler>>) {
        // The old ring is dropped after the lock is released.
        let old = std::mem::replace(&mut *self.steal_list.write(), list);
        drop(old);
    }

    /// Ids of the steal ring in probe order.
    pub fn steal_list_ids(&self) -> Vec<usize> {
        self.steal_list.read().iter().map(|s| s.id).collect()
    }

    /// Whether this scheduler polls the fd watcher.
    pub fn is_fd_scheduler(&self) -> bool {
        self.fd_role.load(Ordering::Acquire)
    }

    /// Lock kind for mailboxes of processes created on this scheduler.
    pub fn message_lock_kind(&self) -> LockKind {
        self.message_lock
    }

    /// The process whose turn is in progress.
    pub fn current_process(&self) -> Option<Arc<Process>> {
        self.current.lock().clone()
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            local: self.counters.local.load(Ordering::Relaxed),
            steals: self.counters.steals.load(Ordering::Relaxed),
            messages: self.counters.messages.load(Ordering::Relaxed),
            sleeps: self.counters.sleeps.load(Ordering::Relaxed),
        }
    }

    /// Put a runnable process on this scheduler's run queue.
    ///
    /// Callers must have made this scheduler the process's owner.
    pub fn enqueue_process(&self, process: Arc<Process>) {
        let from_outside = !super::context::is_in_scheduler_context();
        if self.run_queue.enqueue(process) {
            self.wake.signal();
        }
        // A scheduler only sleeps on its neighbour's descriptor, so wake it
        // through that one when no scheduler thread will pass the work on.
        if from_outside {
            match self.steal_list.read().first() {
                Some(neighbour) => neighbour.wake.signal(),
                None => self.wake.signal(),
            }
        }
    }

    /// Pop the front of the local run queue.
    pub fn next_process(&self) -> Option<Arc<Process>> {
        self.run_queue.dequeue()
    }

    /// Number of processes waiting on the local run queue.
    pub fn queued_processes(&self) -> usize {
        self.run_queue.len()
    }

    /// Run processes until the live count drops to zero.
    ///
    /// Installs this scheduler as the thread's current scheduler for the
    /// duration of the call.
    pub fn run(self: &Arc<Self>) {
        let _context = ContextGuard::install(Arc::clone(self));
        // Registered before the first live count check, so a last process
        // leaving at any later point finds this scheduler.
        RUNNING.lock().push(Arc::downgrade(self));
        let ring = self.ring();
        let watcher = if self.is_fd_scheduler() {
            match fd_watcher() {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    log::error!("scheduler {}: fd watcher unavailable: {}", self.id, e);
                    None
                }
            }
        } else {
            None
        };
        log::debug!(
            "scheduler {} running, ring {:?}{}",
            self.id,
            ring.iter().map(|s| s.id).collect::<Vec<_>>(),
            if watcher.is_some() { ", watching fds" } else { "" }
        );

        while Process::live_count() > 0 && !self.stopping.load(Ordering::Acquire) {
            if let Some(process) = self.next_global_process(&ring, watcher.as_deref()) {
                self.run_turn(process);
            }
        }

        let me = Arc::downgrade(self);
        RUNNING
            .lock()
            .retain(|s| s.strong_count() > 0 && !Weak::ptr_eq(s, &me));
        log::debug!("scheduler {} leaving run loop", self.id);
    }

    /// Signal every scheduler inside `run` and the neighbour each one
    /// sleeps on, which may not have registered yet.
    pub(crate) fn wake_running() {
        let running: Vec<Arc<Scheduler>> = RUNNING.lock().iter().filter_map(Weak::upgrade).collect();
        for scheduler in &running {
            scheduler.wake.signal();
            if let Some(neighbour) = scheduler.steal_list.read().first() {
                neighbour.wake.signal();
            }
        }
    }

    /// Ask `run` to return at the next opportunity.
    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wake.signal();
        for peer in self.steal_list.read().iter() {
            peer.wake.signal();
        }
    }

    fn ring(self: &Arc<Self>) -> Vec<Arc<Scheduler>> {
        let list = self.steal_list.read();
        if list.is_empty() {
            vec![Arc::clone(self)]
        } else {
            list.clone()
        }
    }

    fn next_global_process(
        &self,
        ring: &[Arc<Scheduler>],
        watcher: Option<&FdWatcher>,
    ) -> Option<Arc<Process>> {
        let neighbour = &ring[0];
        let mut was_sleeping = false;
        let mut found = None;

        while Process::live_count() > 0 && !self.stopping.load(Ordering::Acquire) {
            if let Some(watcher) = watcher {
                watcher.wait_fds(&neighbour.wake, false);
            }

            if let Some(process) = self.next_process() {
                self.counters.local.fetch_add(1, Ordering::Relaxed);
                found = Some(process);
                break;
            }
            if let Some(process) = ring.iter().find_map(|peer| peer.next_process()) {
                self.counters.steals.fetch_add(1, Ordering::Relaxed);
                found = Some(process);
                break;
            }

            was_sleeping = true;
            self.counters.sleeps.fetch_add(1, Ordering::Relaxed);
            match watcher {
                Some(watcher) => {
                    watcher.wait_fds(&neighbour.wake, true);
                }
                None => neighbour.wake.wait(),
            }
        }

        if was_sleeping {
            // Pass the wakeup on to whoever sleeps on us.
            self.wake.signal();
        }
        found
    }

    fn run_turn(self: &Arc<Self>, process: Arc<Process>) {
        *self.current.lock() = Some(Arc::clone(&process));
        process.set_owner(Some(Arc::clone(self)));
        process.begin_turn();

        let mut ran = 0;
        while ran < self.quota && process.run_one_message() {
            ran += 1;
        }
        self.counters.messages.fetch_add(ran, Ordering::Relaxed);
        *self.current.lock() = None;

        if process.has_exited() {
            let remaining = process.retire();
            log::trace!(
                "scheduler {}: retired {:?}, {} live",
                self.id,
                process.process_name(),
                remaining
            );
        } else {
            process.requeue_process();
        }
    }

    fn log_stats(&self) {
        let stats = self.stats();
        let processes = stats.processes().max(1);
        log::debug!(
            "scheduler {} stats - processes: {} ({:.1}% local) messages: {} ({:.1} per process) sleeps: {}",
            self.id,
            stats.processes(),
            stats.local_percent(),
            stats.messages,
            stats.messages as f64 / processes as f64,
            stats.sleeps
        );
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("queued", &self.run_queue.len())
            .field("fd_scheduler", &self.is_fd_scheduler())
            .finish()
    }
}
