//! Work-stealing process scheduler
//!
//! A fixed pool of [`Scheduler`]s, one per OS thread, runs processes in
//! quota-limited turns. Idle schedulers steal from their peers in ring
//! order and sleep on eventfd wake descriptors when the whole ring is idle.

pub mod context;
pub mod core;
pub mod queue;
pub mod steal;
pub mod worker;

pub use self::context::{
    current_scheduler, is_in_scheduler_context, set_current_scheduler, set_in_scheduler_context,
};
pub use self::core::{Scheduler, SchedulerConfig, SchedulerStats, DEFAULT_QUOTA};
pub use self::queue::RunQueue;
pub use self::steal::{rotated_ring, StealPlan};
pub use self::worker::{set_cpu_affinity, Worker, WorkerConfig, WorkerId};
