// Error handling framework for schedule evaluation, task execution and the
// scheduler surface

use thiserror::Error;

use crate::task::TaskId;

/// Schedule-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Cron expression '{expression}' has no occurrence within {lookahead_years} years")]
    NoMatch {
        expression: String,
        lookahead_years: i32,
    },

    #[error("No next execution time available for {schedule_type} schedule")]
    NoNextExecution { schedule_type: String },
}

/// Task execution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Task {task_id} failed: {reason}")]
    TaskFailed { task_id: TaskId, reason: String },

    #[error("Worker pool saturated ({pool_size} slots busy), skipping firing of task {task_id}")]
    PoolSaturated { task_id: TaskId, pool_size: usize },
}

/// Errors returned by the scheduler API
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("Scheduler is shutting down and no longer accepts tasks")]
    ShuttingDown,

    #[error("Scheduler dispatch loop is already running")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
        assert!(err.to_string().contains("* * * *"));
    }

    #[test]
    fn test_no_match_display() {
        let err = ScheduleError::NoMatch {
            expression: "0 0 0 30 2 ?".to_string(),
            lookahead_years: 5,
        };
        assert!(err.to_string().contains("within 5 years"));
    }

    #[test]
    fn test_pool_saturated_display() {
        let task_id = TaskId::new();
        let err = ExecutionError::PoolSaturated {
            task_id,
            pool_size: 1,
        };
        assert!(err.to_string().contains("1 slots busy"));
        assert!(err.to_string().contains(&task_id.to_string()));
    }

    #[test]
    fn test_scheduler_error_wraps_schedule_error() {
        let err: SchedulerError = ScheduleError::InvalidTimezone("Mars/Olympus".to_string()).into();
        assert!(matches!(err, SchedulerError::Schedule(_)));
        assert_eq!(err.to_string(), "Invalid timezone: Mars/Olympus");
    }
}
