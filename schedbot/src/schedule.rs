// Trigger policies and next fire time calculation
//
// Fixed-rate, fixed-delay, cron, one-shot, and an initial-delay wrapper that
// shifts only the first firing of any other policy.

use crate::cron::CronExpression;
use crate::errors::ScheduleError;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::Arc;

/// ScheduleTrigger defines the interface for calculating fire times
pub trait ScheduleTrigger {
    /// Fire time of the first execution for a task registered at `registered_at`
    fn first_fire_time(
        &self,
        registered_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError>;

    /// Fire time following an execution scheduled for `previous_start`.
    ///
    /// `previous_finish` is `None` when the next firing is computed at
    /// dispatch time, before the execution has finished. Returns `None` when
    /// the schedule is complete.
    fn next_fire_time(
        &self,
        previous_start: DateTime<Utc>,
        previous_finish: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError>;
}

/// How and when a task fires
#[derive(Debug, Clone)]
pub enum TriggerPolicy {
    /// Every `interval` measured from the previous scheduled start.
    ///
    /// Executions may overlap when a run outlasts the interval.
    FixedRate { interval: Duration },

    /// `delay` after the previous execution finished; never overlaps itself
    FixedDelay { delay: Duration },

    /// Calendar schedule evaluated in `timezone`.
    ///
    /// Executions may overlap when a run outlasts the gap to the next match.
    Cron {
        expression: Arc<CronExpression>,
        timezone: Tz,
    },

    /// A single execution at `at`
    OneShot { at: DateTime<Utc> },

    /// First firing `delay` after registration, then `inner` takes over
    InitialDelay {
        delay: Duration,
        inner: Box<TriggerPolicy>,
    },
}

fn positive_duration(value: std::time::Duration, what: &str) -> Result<Duration, ScheduleError> {
    if value.is_zero() {
        return Err(ScheduleError::InvalidConfiguration(format!(
            "{} must be greater than zero",
            what
        )));
    }
    Duration::from_std(value).map_err(|e| {
        ScheduleError::InvalidConfiguration(format!("{} is out of range: {}", what, e))
    })
}

impl TriggerPolicy {
    /// Fixed-rate policy; the interval must be positive
    pub fn fixed_rate(interval: std::time::Duration) -> Result<Self, ScheduleError> {
        Ok(Self::FixedRate {
            interval: positive_duration(interval, "fixed rate interval")?,
        })
    }

    /// Fixed-delay policy; the delay must be positive
    pub fn fixed_delay(delay: std::time::Duration) -> Result<Self, ScheduleError> {
        Ok(Self::FixedDelay {
            delay: positive_duration(delay, "fixed delay")?,
        })
    }

    /// Cron policy evaluated in UTC
    pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
        Self::cron_in(expression, Tz::UTC)
    }

    /// Cron policy evaluated in the given timezone
    pub fn cron_in(expression: &str, timezone: Tz) -> Result<Self, ScheduleError> {
        Ok(Self::Cron {
            expression: Arc::new(CronExpression::from_str(expression)?),
            timezone,
        })
    }

    /// Single execution at `at`; an instant in the past fires immediately
    pub fn one_shot(at: DateTime<Utc>) -> Self {
        Self::OneShot { at }
    }

    /// Delay the first firing by `delay`.
    ///
    /// Wrapping an already delayed policy replaces its delay.
    pub fn with_initial_delay(self, delay: std::time::Duration) -> Result<Self, ScheduleError> {
        let delay = Duration::from_std(delay).map_err(|e| {
            ScheduleError::InvalidConfiguration(format!("initial delay is out of range: {}", e))
        })?;
        let inner = match self {
            Self::InitialDelay { inner, .. } => inner,
            other => Box::new(other),
        };
        Ok(Self::InitialDelay { delay, inner })
    }

    /// The delay applied to the first firing, if any
    pub fn initial_delay(&self) -> Option<Duration> {
        match self {
            Self::InitialDelay { delay, .. } => Some(*delay),
            _ => None,
        }
    }

    /// Policy without its initial-delay wrapper
    pub fn base(&self) -> &TriggerPolicy {
        match self {
            Self::InitialDelay { inner, .. } => inner.base(),
            other => other,
        }
    }

    /// Whether the next firing is scheduled when an execution starts rather
    /// than when it finishes. Such policies allow overlapping executions.
    pub fn reschedules_on_dispatch(&self) -> bool {
        matches!(self.base(), Self::FixedRate { .. } | Self::Cron { .. })
    }

    /// Whether the policy fires exactly once
    pub fn is_one_shot(&self) -> bool {
        matches!(self.base(), Self::OneShot { .. })
    }

    /// Short label used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self.base() {
            Self::FixedRate { .. } => "fixed_rate",
            Self::FixedDelay { .. } => "fixed_delay",
            Self::Cron { .. } => "cron",
            Self::OneShot { .. } => "one_shot",
            Self::InitialDelay { .. } => "initial_delay",
        }
    }
}

impl ScheduleTrigger for TriggerPolicy {
    fn first_fire_time(
        &self,
        registered_at: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            // Periodic policies start right away
            Self::FixedRate { .. } | Self::FixedDelay { .. } => Ok(Some(registered_at)),

            Self::Cron {
                expression,
                timezone,
            } => expression
                .next_after_in(registered_at, timezone)
                .map(Some),

            Self::OneShot { at } => Ok(Some(*at)),

            Self::InitialDelay { delay, .. } => Ok(Some(registered_at + *delay)),
        }
    }

    fn next_fire_time(
        &self,
        previous_start: DateTime<Utc>,
        previous_finish: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Self::FixedRate { interval } => {
                calculate_fixed_rate_next_execution(*interval, previous_start, now)
            }

            Self::FixedDelay { delay } => {
                calculate_fixed_delay_next_execution(*delay, previous_finish.unwrap_or(now))
            }

            Self::Cron {
                expression,
                timezone,
            } => calculate_cron_next_execution(expression, timezone, previous_start, now),

            Self::OneShot { .. } => Ok(None),

            Self::InitialDelay { inner, .. } => {
                inner.next_fire_time(previous_start, previous_finish, now)
            }
        }
    }
}

/// Next start = previous scheduled start + interval.
///
/// An overrun (the computed time already passed) yields `now` once instead of
/// a burst of catch-up firings; the schedule re-anchors on that firing.
fn calculate_fixed_rate_next_execution(
    interval: Duration,
    previous_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let next = previous_start + interval;
    Ok(Some(next.max(now)))
}

/// Next start = previous finish + delay
fn calculate_fixed_delay_next_execution(
    delay: Duration,
    previous_finish: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    Ok(Some(previous_finish + delay))
}

/// Next cron match after `now`, or after the previous firing if the clock
/// has not moved past it yet
fn calculate_cron_next_execution(
    expression: &CronExpression,
    timezone: &Tz,
    previous_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let reference = now.max(previous_start);
    expression.next_after_in(reference, timezone).map(Some)
}
