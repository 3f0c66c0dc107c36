// Scheduler engine: registration surface and the dispatch loop

use super::pool::{SlotRequest, WorkerPool, WorkerSlot};
use super::queue::{ScheduleQueue, ScheduledEntry};
use crate::clock::{Clock, SystemClock};
use crate::config::{SaturationPolicy, SchedulerSettings};
use crate::errors::{ExecutionError, ScheduleError, SchedulerError};
use crate::events::{EventSink, SchedulerEvent, TracingEventSink};
use crate::schedule::ScheduleTrigger;
use crate::task::{CancellationFlag, TaskContext, TaskDescriptor, TaskHandle, TaskId};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of executions allowed to run at once
    pub pool_size: usize,
    pub saturation_policy: SaturationPolicy,
    /// Default wait for in-flight executions on shutdown
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            saturation_policy: SaturationPolicy::Block,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            pool_size: settings.pool_size,
            saturation_policy: settings.saturation_policy,
            drain_timeout: Duration::from_secs(settings.drain_timeout_seconds),
        }
    }
}

/// Result of a shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Executions that finished during the drain window
    pub drained: usize,
    /// Tasks with an execution still running when the drain window closed
    pub abandoned: Vec<TaskId>,
}

/// Scheduler trait for task scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Add a task; its first firing is computed immediately
    fn register(&self, descriptor: TaskDescriptor) -> Result<TaskHandle, SchedulerError>;

    /// Stop future firings of a task. Handles issued by another scheduler
    /// are ignored.
    fn unregister(&self, handle: &TaskHandle);

    /// Drive the dispatch loop until shutdown
    async fn run(&self) -> Result<(), SchedulerError>;

    /// Stop accepting work and wait up to `drain_timeout` for in-flight executions
    async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport;
}

enum Command {
    Register {
        descriptor: Arc<TaskDescriptor>,
        cancellation: CancellationFlag,
        first_fire_time: DateTime<Utc>,
    },
    Unregister(TaskId),
    Shutdown {
        drain_timeout: Duration,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

struct Completion {
    execution_id: u64,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    outcome: anyhow::Result<()>,
}

struct Registration {
    descriptor: Arc<TaskDescriptor>,
    cancellation: CancellationFlag,
}

struct InFlight {
    descriptor: Arc<TaskDescriptor>,
    fire_time: DateTime<Utc>,
}

/// In-process scheduler running every execution on a bounded worker pool
pub struct TaskScheduler {
    /// Stamped on every issued handle
    instance_id: Uuid,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    pool: Arc<WorkerPool>,
    commands: mpsc::UnboundedSender<Command>,
    accepting: AtomicBool,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl TaskScheduler {
    /// Create a scheduler using the system clock and tracing-backed events
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_collaborators(config, Arc::new(SystemClock), Arc::new(TracingEventSink))
    }

    pub fn with_collaborators(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(config.pool_size, config.saturation_policy));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            clock: Arc::clone(&clock),
            events: Arc::clone(&events),
            pool: Arc::clone(&pool),
            commands: commands_rx,
            completions_tx,
            completions: completions_rx,
            queue: ScheduleQueue::new(),
            registered: HashMap::new(),
            in_flight: HashMap::new(),
            next_execution_id: 0,
        };

        Self {
            instance_id: Uuid::new_v4(),
            config,
            clock,
            events,
            pool,
            commands: commands_tx,
            accepting: AtomicBool::new(true),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Spawn the dispatch loop onto the current runtime
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<(), SchedulerError>> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Shut down with the configured drain timeout
    pub async fn shutdown_gracefully(&self) -> ShutdownReport {
        self.shutdown(self.config.drain_timeout).await
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scheduler for TaskScheduler {
    #[instrument(skip_all, fields(task_name = %descriptor.name()))]
    fn register(&self, descriptor: TaskDescriptor) -> Result<TaskHandle, SchedulerError> {
        if !self.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }

        let descriptor = descriptor.with_fresh_id();
        let registered_at = self.clock.now();
        let first_fire_time = descriptor
            .policy()
            .first_fire_time(registered_at)?
            .ok_or_else(|| ScheduleError::NoNextExecution {
                schedule_type: descriptor.policy().kind().to_string(),
            })?;

        let cancellation = CancellationFlag::new();
        let handle = TaskHandle::new(
            descriptor.id(),
            descriptor.name().to_string(),
            self.instance_id,
            cancellation.clone(),
        );
        let descriptor = Arc::new(descriptor);

        // Recorded first so it precedes any event of the task's executions
        self.events.record(&SchedulerEvent::TaskRegistered {
            task_id: descriptor.id(),
            task_name: descriptor.name().to_string(),
            policy: descriptor.policy().kind(),
            first_fire_time,
        });

        self.commands
            .send(Command::Register {
                descriptor,
                cancellation,
                first_fire_time,
            })
            .map_err(|_| SchedulerError::ShuttingDown)?;

        Ok(handle)
    }

    fn unregister(&self, handle: &TaskHandle) {
        if handle.scheduler_id() != self.instance_id {
            debug!(task_id = %handle.id(), "Ignoring handle issued by another scheduler");
            return;
        }

        handle.cancellation().cancel();
        if self.commands.send(Command::Unregister(handle.id())).is_err() {
            debug!(task_id = %handle.id(), "Dispatch loop gone, nothing to unregister");
        }
    }

    #[instrument(skip(self))]
    async fn run(&self) -> Result<(), SchedulerError> {
        if !self.is_accepting() {
            return Err(SchedulerError::ShuttingDown);
        }

        let dispatcher = self
            .dispatcher
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::AlreadyRunning)?;

        dispatcher.run().await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        info!("Shutting down scheduler");
        self.accepting.store(false, Ordering::SeqCst);
        self.pool.close();

        // Never started: nothing is in flight
        let idle = self.dispatcher.lock().await.take();
        if let Some(mut dispatcher) = idle {
            dispatcher.drain_commands();
            return dispatcher.drain(Duration::ZERO).await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown {
                drain_timeout,
                reply: reply_tx,
            })
            .is_err()
        {
            return ShutdownReport::default();
        }

        let report = reply_rx.await.unwrap_or_default();
        info!(
            drained = report.drained,
            abandoned = report.abandoned.len(),
            "Scheduler stopped"
        );
        report
    }
}

/// Owns the queue and every piece of mutable scheduling state
struct Dispatcher {
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    pool: Arc<WorkerPool>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    queue: ScheduleQueue,
    registered: HashMap<TaskId, Registration>,
    in_flight: HashMap<u64, InFlight>,
    next_execution_id: u64,
}

impl Dispatcher {
    async fn run(mut self) {
        info!(pool_size = self.pool.size(), "Dispatch loop started");

        loop {
            self.dispatch_due().await;
            let wait = self.time_until_next_fire();

            tokio::select! {
                biased;
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { drain_timeout, reply }) => {
                        let report = self.drain(drain_timeout).await;
                        let _ = reply.send(report);
                        break;
                    }
                    Some(command) => self.apply(command),
                    None => {
                        self.drain(Duration::ZERO).await;
                        break;
                    }
                },
                _ = sleep_for(wait) => {}
            }
        }

        info!("Dispatch loop stopped");
    }

    fn time_until_next_fire(&self) -> Option<Duration> {
        let next = self.queue.peek_fire_time()?;
        Some((next - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Hand every due entry to the pool, earliest first
    async fn dispatch_due(&mut self) {
        while let Some(entry) = self.queue.pop_due(self.clock.now()) {
            if !self.is_live(entry.descriptor.id()) {
                continue;
            }

            match self.pool.request_slot().await {
                SlotRequest::Granted(slot) => {
                    // Unregister may have raced with a blocked slot request
                    if self.is_live(entry.descriptor.id()) {
                        self.launch(entry, slot);
                    }
                }
                SlotRequest::Saturated => self.skip_firing(entry),
                SlotRequest::Closed => break,
            }
        }

        telemetry::update_pending_tasks(self.queue.len());
    }

    fn is_live(&self, task_id: TaskId) -> bool {
        self.registered
            .get(&task_id)
            .is_some_and(|registration| !registration.cancellation.is_cancelled())
    }

    fn launch(&mut self, entry: ScheduledEntry, slot: WorkerSlot) {
        let ScheduledEntry {
            fire_time,
            descriptor,
            ..
        } = entry;
        let Some(cancellation) = self
            .registered
            .get(&descriptor.id())
            .map(|registration| registration.cancellation.clone())
        else {
            return;
        };

        let execution_id = self.next_execution_id;
        self.next_execution_id += 1;
        self.in_flight.insert(
            execution_id,
            InFlight {
                descriptor: Arc::clone(&descriptor),
                fire_time,
            },
        );

        if descriptor.policy().reschedules_on_dispatch() {
            self.reschedule(&descriptor, fire_time, None);
        }

        let span = info_span!(
            "task_execution",
            task_id = %descriptor.id(),
            task_name = %descriptor.name(),
            execution_id
        );
        let clock = Arc::clone(&self.clock);
        let events = Arc::clone(&self.events);
        let completions = self.completions_tx.clone();

        tokio::spawn(
            async move {
                let started_at = clock.now();
                events.record(&SchedulerEvent::TaskStarted {
                    task_id: descriptor.id(),
                    task_name: descriptor.name().to_string(),
                    fire_time,
                    started_at,
                });

                let ctx = TaskContext {
                    task_id: descriptor.id(),
                    task_name: descriptor.name().to_string(),
                    scheduled_at: fire_time,
                    started_at,
                    cancellation,
                };
                let payload = descriptor.payload();
                let outcome = match AssertUnwindSafe(payload.run(ctx)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow::anyhow!("task panicked: {}", panic_message(&*panic))),
                };
                let finished_at = clock.now();

                // Free the slot before the dispatcher sees the completion
                drop(slot);
                let _ = completions.send(Completion {
                    execution_id,
                    started_at,
                    finished_at,
                    outcome,
                });
            }
            .instrument(span),
        );

        telemetry::update_in_flight_tasks(self.in_flight.len());
    }

    fn skip_firing(&mut self, entry: ScheduledEntry) {
        let descriptor = entry.descriptor;
        let error = ExecutionError::PoolSaturated {
            task_id: descriptor.id(),
            pool_size: self.pool.size(),
        };

        telemetry::record_task_skipped(&descriptor.id(), descriptor.name());
        self.events.record(&SchedulerEvent::FiringSkipped {
            task_id: descriptor.id(),
            task_name: descriptor.name().to_string(),
            fire_time: entry.fire_time,
            reason: error.to_string(),
        });

        let now = self.clock.now();
        self.reschedule(&descriptor, entry.fire_time, Some(now));
    }

    fn on_completion(&mut self, completion: Completion) {
        let Some(InFlight {
            descriptor,
            fire_time,
        }) = self.in_flight.remove(&completion.execution_id)
        else {
            return;
        };

        let duration = completion.finished_at - completion.started_at;
        telemetry::record_task_duration(
            &descriptor.id(),
            descriptor.name(),
            duration.num_milliseconds() as f64 / 1000.0,
        );
        telemetry::update_in_flight_tasks(self.in_flight.len());

        match completion.outcome {
            Ok(()) => {
                telemetry::record_task_success(&descriptor.id(), descriptor.name());
                self.events.record(&SchedulerEvent::TaskCompleted {
                    task_id: descriptor.id(),
                    task_name: descriptor.name().to_string(),
                    fire_time,
                    duration_ms: duration.num_milliseconds(),
                });
            }
            Err(e) => {
                let error = ExecutionError::TaskFailed {
                    task_id: descriptor.id(),
                    reason: format!("{:#}", e),
                };
                telemetry::record_task_failure(&descriptor.id(), descriptor.name());
                self.events.record(&SchedulerEvent::TaskFailed {
                    task_id: descriptor.id(),
                    task_name: descriptor.name().to_string(),
                    fire_time,
                    error: error.to_string(),
                });
            }
        }

        if !descriptor.policy().reschedules_on_dispatch() {
            self.reschedule(&descriptor, fire_time, Some(completion.finished_at));
        }
    }

    /// Queue the next firing, or retire the task when its schedule is exhausted
    fn reschedule(
        &mut self,
        descriptor: &Arc<TaskDescriptor>,
        previous_start: DateTime<Utc>,
        previous_finish: Option<DateTime<Utc>>,
    ) {
        if !self.is_live(descriptor.id()) {
            return;
        }

        let now = self.clock.now();
        match descriptor
            .policy()
            .next_fire_time(previous_start, previous_finish, now)
        {
            Ok(Some(next)) => self.queue.push(Arc::clone(descriptor), next),
            Ok(None) => {
                debug!(task_id = %descriptor.id(), "Schedule complete, retiring task");
                self.registered.remove(&descriptor.id());
            }
            Err(e) => {
                self.registered.remove(&descriptor.id());
                self.events.record(&SchedulerEvent::TaskDropped {
                    task_id: descriptor.id(),
                    task_name: descriptor.name().to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register {
                descriptor,
                cancellation,
                first_fire_time,
            } => {
                debug!(
                    task_id = %descriptor.id(),
                    first_fire_time = %first_fire_time,
                    "Queueing registered task"
                );
                self.queue.push(Arc::clone(&descriptor), first_fire_time);
                self.registered.insert(
                    descriptor.id(),
                    Registration {
                        descriptor,
                        cancellation,
                    },
                );
            }
            Command::Unregister(task_id) => {
                if let Some(registration) = self.registered.remove(&task_id) {
                    registration.cancellation.cancel();
                    self.queue.remove(task_id);
                    self.events.record(&SchedulerEvent::TaskUnregistered {
                        task_id,
                        task_name: registration.descriptor.name().to_string(),
                    });
                }
            }
            Command::Shutdown { reply, .. } => {
                let _ = reply.send(ShutdownReport::default());
            }
        }
    }

    /// Apply registrations that arrived before the loop ever ran
    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }

    /// Cancel everything pending and wait for in-flight executions until the deadline
    async fn drain(&mut self, drain_timeout: Duration) -> ShutdownReport {
        info!(
            in_flight = self.in_flight.len(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Draining in-flight executions"
        );

        self.queue.clear();
        for (_, registration) in self.registered.drain() {
            registration.cancellation.cancel();
        }
        telemetry::update_pending_tasks(0);

        let deadline = tokio::time::Instant::now() + drain_timeout;
        let mut drained = 0;
        while !self.in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, self.completions.recv()).await {
                Ok(Some(completion)) => {
                    self.on_completion(completion);
                    drained += 1;
                }
                Ok(None) | Err(_) => break,
            }
        }

        let mut remaining: Vec<(u64, InFlight)> = self.in_flight.drain().collect();
        remaining.sort_by_key(|(execution_id, _)| *execution_id);

        let mut abandoned = Vec::new();
        for (_, in_flight) in remaining {
            let task_id = in_flight.descriptor.id();
            warn!(task_id = %task_id, "Execution still running after drain timeout");
            self.events.record(&SchedulerEvent::TaskAbandoned {
                task_id,
                task_name: in_flight.descriptor.name().to_string(),
                fire_time: in_flight.fire_time,
            });
            if !abandoned.contains(&task_id) {
                abandoned.push(task_id);
            }
        }
        telemetry::update_in_flight_tasks(0);

        ShutdownReport { drained, abandoned }
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::schedule::TriggerPolicy;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn paused_scheduler(config: SchedulerConfig) -> Arc<TaskScheduler> {
        let clock = MonotonicClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        Arc::new(TaskScheduler::with_collaborators(
            config,
            Arc::new(clock),
            Arc::new(TracingEventSink),
        ))
    }

    fn counting_task(name: &str, policy: TriggerPolicy, counter: Arc<AtomicUsize>) -> TaskDescriptor {
        TaskDescriptor::new(name, policy, move |_ctx: TaskContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.saturation_policy, SaturationPolicy::Block);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_scheduler_config_from_settings() {
        let settings = SchedulerSettings {
            pool_size: 4,
            saturation_policy: SaturationPolicy::Reject,
            drain_timeout_seconds: 5,
            ..SchedulerSettings::default()
        };
        let config = SchedulerConfig::from(&settings);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.saturation_policy, SaturationPolicy::Reject);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*boxed), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*boxed), "owned message");
        let boxed: Box<dyn Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_fires_on_schedule() {
        let scheduler = paused_scheduler(SchedulerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(counting_task(
                "tick",
                TriggerPolicy::fixed_rate(Duration::from_secs(1)).unwrap(),
                Arc::clone(&counter),
            ))
            .unwrap();

        let run = scheduler.start();
        // Firings at t = 0, 1, 2, 3
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let report = scheduler.shutdown(Duration::from_secs(1)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(report.abandoned.is_empty());
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_twice_is_rejected() {
        let scheduler = paused_scheduler(SchedulerConfig::default());
        let run = scheduler.start();
        tokio::task::yield_now().await;

        let second = scheduler.run().await;
        assert!(matches!(second, Err(SchedulerError::AlreadyRunning)));

        scheduler.shutdown(Duration::ZERO).await;
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_after_shutdown_is_rejected() {
        let scheduler = paused_scheduler(SchedulerConfig::default());
        let report = scheduler.shutdown(Duration::ZERO).await;
        assert_eq!(report, ShutdownReport::default());
        assert!(!scheduler.is_accepting());

        let result = scheduler.register(counting_task(
            "late",
            TriggerPolicy::fixed_delay(Duration::from_secs(1)).unwrap(),
            Arc::new(AtomicUsize::new(0)),
        ));
        assert!(matches!(result, Err(SchedulerError::ShuttingDown)));
        assert!(matches!(scheduler.run().await, Err(SchedulerError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_payload_does_not_stop_the_loop() {
        let scheduler = paused_scheduler(SchedulerConfig::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let calls = Arc::clone(&counter);
        scheduler
            .register(TaskDescriptor::new(
                "panics",
                TriggerPolicy::fixed_rate(Duration::from_secs(1)).unwrap(),
                move |_ctx: TaskContext| {
                    let calls = Arc::clone(&calls);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                            panic!("payload exploded");
                        }
                        Ok::<_, anyhow::Error>(())
                    }
                },
            ))
            .unwrap();

        let run = scheduler.start();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.shutdown(Duration::from_secs(1)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(run.await.unwrap().is_ok());
    }
}
