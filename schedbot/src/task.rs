// Task descriptors, payloads and handles

use crate::errors::ScheduleError;
use crate::schedule::TriggerPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Opaque task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cooperative cancellation flag shared between the scheduler and the
/// executions of one task. The scheduler never preempts a running payload;
/// payloads that care check the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Information handed to a payload for one execution
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    /// Fire time the execution was scheduled for
    pub scheduled_at: DateTime<Utc>,
    /// When the worker actually started the payload
    pub started_at: DateTime<Utc>,
    pub cancellation: CancellationFlag,
}

impl TaskContext {
    /// Whether the task was unregistered or the scheduler is shutting down
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// The work a task performs.
///
/// Implemented for any `Fn(TaskContext) -> Future<Output = anyhow::Result<()>>`,
/// so plain async closures can be registered directly. A payload should not
/// block indefinitely; the scheduler does not enforce a timeout.
#[async_trait]
pub trait TaskPayload: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskPayload for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Immutable description of one schedulable unit
#[derive(Clone)]
pub struct TaskDescriptor {
    id: TaskId,
    name: String,
    policy: TriggerPolicy,
    payload: Arc<dyn TaskPayload>,
}

impl TaskDescriptor {
    pub fn new(
        name: impl Into<String>,
        policy: TriggerPolicy,
        payload: impl TaskPayload + 'static,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            policy,
            payload: Arc::new(payload),
        }
    }

    /// Delay the first execution by `delay`
    pub fn with_initial_delay(mut self, delay: std::time::Duration) -> Result<Self, ScheduleError> {
        self.policy = self.policy.with_initial_delay(delay)?;
        Ok(self)
    }

    /// Identifier of the descriptor's latest registration. Every call to
    /// `register` assigns a fresh id, so clones never share one.
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn with_fresh_id(mut self) -> Self {
        self.id = TaskId::new();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    pub fn initial_delay(&self) -> Option<chrono::Duration> {
        self.policy.initial_delay()
    }

    pub(crate) fn payload(&self) -> Arc<dyn TaskPayload> {
        Arc::clone(&self.payload)
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Handle returned by registration, used to unregister the task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    name: String,
    scheduler_id: Uuid,
    cancellation: CancellationFlag,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        scheduler_id: Uuid,
        cancellation: CancellationFlag,
    ) -> Self {
        Self {
            id,
            name,
            scheduler_id,
            cancellation,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task was unregistered or the scheduler shut down
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Instance id of the scheduler that issued this handle
    pub(crate) fn scheduler_id(&self) -> Uuid {
        self.scheduler_id
    }

    pub(crate) fn cancellation(&self) -> &CancellationFlag {
        &self.cancellation
    }
}
