// Demonstration tasks registered by the scheduler binary

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use schedbot::{ScheduleError, TaskContext, TaskDescriptor, TriggerPolicy};
use std::time::Duration;
use tracing::info;

/// Work time of the fixed-delay task, longer than its delay
const SLOW_TASK_DURATION: Duration = Duration::from_secs(5);

/// Wall-clock time of day as HH:MM:SS
pub fn format_time(at: DateTime<Utc>, timezone: Tz) -> String {
    at.with_timezone(&timezone).format("%H:%M:%S").to_string()
}

pub fn demo_tasks(timezone: Tz) -> Result<Vec<TaskDescriptor>, ScheduleError> {
    let fixed_rate = TaskDescriptor::new(
        "fixed-rate",
        TriggerPolicy::fixed_rate(Duration::from_secs(2))?,
        move |ctx: TaskContext| async move {
            info!(time = %format_time(ctx.started_at, timezone), "Fixed rate task");
            Ok::<_, anyhow::Error>(())
        },
    );

    let fixed_delay = TaskDescriptor::new(
        "fixed-delay",
        TriggerPolicy::fixed_delay(Duration::from_secs(2))?,
        move |ctx: TaskContext| async move {
            info!(time = %format_time(ctx.started_at, timezone), "Fixed delay task started");
            tokio::time::sleep(SLOW_TASK_DURATION).await;
            info!(time = %format_time(Utc::now(), timezone), "Fixed delay task finished");
            Ok::<_, anyhow::Error>(())
        },
    );

    let initial_delay = TaskDescriptor::new(
        "initial-delay",
        TriggerPolicy::fixed_rate(Duration::from_secs(2))?,
        move |ctx: TaskContext| async move {
            info!(time = %format_time(ctx.started_at, timezone), "Fixed rate task with initial delay");
            Ok::<_, anyhow::Error>(())
        },
    )
    .with_initial_delay(Duration::from_secs(5))?;

    let every_minute = TaskDescriptor::new(
        "every-minute",
        TriggerPolicy::cron_in("0 * * * * ?", timezone)?,
        move |ctx: TaskContext| async move {
            info!(time = %format_time(ctx.started_at, timezone), "Cron task");
            Ok::<_, anyhow::Error>(())
        },
    );

    Ok(vec![fixed_rate, fixed_delay, initial_delay, every_minute])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_time_uses_timezone() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 3, 4, 5).unwrap();
        assert_eq!(format_time(at, chrono_tz::UTC), "03:04:05");
        assert_eq!(format_time(at, chrono_tz::Asia::Ho_Chi_Minh), "10:04:05");
    }

    #[test]
    fn test_demo_tasks_policies() {
        let tasks = demo_tasks(chrono_tz::UTC).unwrap();
        let kinds: Vec<(&str, &str)> = tasks
            .iter()
            .map(|task| (task.name(), task.policy().kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("fixed-rate", "fixed_rate"),
                ("fixed-delay", "fixed_delay"),
                ("initial-delay", "fixed_rate"),
                ("every-minute", "cron"),
            ]
        );
        assert_eq!(tasks[2].initial_delay(), Some(chrono::Duration::seconds(5)));
    }
}
