// In-process periodic task scheduler: cron evaluation, trigger policies and
// a bounded worker pool driven by a single dispatch loop

pub mod clock;
pub mod config;
pub mod cron;
pub mod errors;
pub mod events;
pub mod schedule;
pub mod scheduler;
pub mod task;
pub mod telemetry;

pub use errors::{ExecutionError, ScheduleError, SchedulerError};
pub use schedule::{ScheduleTrigger, TriggerPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, ShutdownReport, TaskScheduler};
pub use task::{TaskContext, TaskDescriptor, TaskHandle, TaskId};
