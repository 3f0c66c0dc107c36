// Scheduler module: pending queue, worker pool and the dispatch loop

pub mod engine;
pub mod pool;
pub mod queue;

pub use crate::config::SaturationPolicy;
pub use engine::{Scheduler, SchedulerConfig, ShutdownReport, TaskScheduler};
pub use pool::{SlotRequest, WorkerPool, WorkerSlot};
pub use queue::{ScheduleQueue, ScheduledEntry};
