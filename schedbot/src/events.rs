// Structured scheduler events and the sink that receives them

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Something observable that happened to a task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskRegistered {
        task_id: TaskId,
        task_name: String,
        policy: &'static str,
        first_fire_time: DateTime<Utc>,
    },
    TaskUnregistered {
        task_id: TaskId,
        task_name: String,
    },
    TaskStarted {
        task_id: TaskId,
        task_name: String,
        fire_time: DateTime<Utc>,
        started_at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        task_name: String,
        fire_time: DateTime<Utc>,
        duration_ms: i64,
    },
    TaskFailed {
        task_id: TaskId,
        task_name: String,
        fire_time: DateTime<Utc>,
        error: String,
    },
    /// A firing was dropped because the worker pool was saturated
    FiringSkipped {
        task_id: TaskId,
        task_name: String,
        fire_time: DateTime<Utc>,
        reason: String,
    },
    /// The task was removed because its schedule cannot produce another firing
    TaskDropped {
        task_id: TaskId,
        task_name: String,
        reason: String,
    },
    /// An execution was still running when the shutdown drain timed out
    TaskAbandoned {
        task_id: TaskId,
        task_name: String,
        fire_time: DateTime<Utc>,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::TaskRegistered { task_id, .. }
            | Self::TaskUnregistered { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::FiringSkipped { task_id, .. }
            | Self::TaskDropped { task_id, .. }
            | Self::TaskAbandoned { task_id, .. } => *task_id,
        }
    }
}

/// Logging collaborator injected into the scheduler
pub trait EventSink: Send + Sync {
    fn record(&self, event: &SchedulerEvent);
}

/// Default sink writing every event as a structured tracing record
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::TaskRegistered {
                task_id,
                task_name,
                policy,
                first_fire_time,
            } => info!(
                task_id = %task_id,
                task_name = %task_name,
                policy = policy,
                first_fire_time = %first_fire_time,
                "Task registered"
            ),
            SchedulerEvent::TaskUnregistered { task_id, task_name } => {
                info!(task_id = %task_id, task_name = %task_name, "Task unregistered")
            }
            SchedulerEvent::TaskStarted {
                task_id,
                task_name,
                fire_time,
                started_at,
            } => debug!(
                task_id = %task_id,
                task_name = %task_name,
                fire_time = %fire_time,
                started_at = %started_at,
                "Task started"
            ),
            SchedulerEvent::TaskCompleted {
                task_id,
                task_name,
                fire_time,
                duration_ms,
            } => debug!(
                task_id = %task_id,
                task_name = %task_name,
                fire_time = %fire_time,
                duration_ms = duration_ms,
                "Task completed"
            ),
            SchedulerEvent::TaskFailed {
                task_id,
                task_name,
                fire_time,
                error,
            } => error!(
                task_id = %task_id,
                task_name = %task_name,
                fire_time = %fire_time,
                error = %error,
                "Task execution failed"
            ),
            SchedulerEvent::FiringSkipped {
                task_id,
                task_name,
                fire_time,
                reason,
            } => warn!(
                task_id = %task_id,
                task_name = %task_name,
                fire_time = %fire_time,
                reason = %reason,
                "Firing skipped"
            ),
            SchedulerEvent::TaskDropped {
                task_id,
                task_name,
                reason,
            } => warn!(
                task_id = %task_id,
                task_name = %task_name,
                reason = %reason,
                "Task dropped from schedule"
            ),
            SchedulerEvent::TaskAbandoned {
                task_id,
                task_name,
                fire_time,
            } => warn!(
                task_id = %task_id,
                task_name = %task_name,
                fire_time = %fire_time,
                "Task abandoned at shutdown"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let task_id = TaskId::new();
        let event = SchedulerEvent::TaskUnregistered {
            task_id,
            task_name: "report".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_unregistered");
        assert_eq!(json["task_name"], "report");
        assert_eq!(json["task_id"], task_id.to_string());
        assert_eq!(event.task_id(), task_id);
    }

    #[test]
    fn test_tracing_sink_accepts_every_event() {
        let sink = TracingEventSink;
        let task_id = TaskId::new();
        let now = Utc::now();
        sink.record(&SchedulerEvent::TaskFailed {
            task_id,
            task_name: "t".to_string(),
            fire_time: now,
            error: "boom".to_string(),
        });
        sink.record(&SchedulerEvent::TaskAbandoned {
            task_id,
            task_name: "t".to_string(),
            fire_time: now,
        });
    }
}
