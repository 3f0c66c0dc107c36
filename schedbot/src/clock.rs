// Clock sources used by triggers and the dispatch loop

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;

/// Source of the current time.
///
/// The dispatch loop waits on the tokio timer for the difference between a
/// fire time and `now()`, so an implementation must advance at the same pace
/// as the tokio clock of the runtime the scheduler runs on.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by the operating system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored once and then advanced by the tokio monotonic clock.
///
/// Immune to wall-clock adjustments after construction, and follows virtual
/// time when the tokio clock is paused.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: Instant,
}

impl MonotonicClock {
    /// Anchor at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Anchor at an explicit wall-clock time
    pub fn starting_at(wall_anchor: DateTime<Utc>) -> Self {
        Self {
            wall_anchor,
            instant_anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed =
            Duration::from_std(self.instant_anchor.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.wall_anchor + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_system_clock_tracks_utc_now() {
        let before = Utc::now();
        let now = SystemClock.now();
        let after = Utc::now();
        assert!(before <= now && now <= after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_tokio_time() {
        let anchor = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let clock = MonotonicClock::starting_at(anchor);
        assert_eq!(clock.now(), anchor);

        tokio::time::advance(std::time::Duration::from_millis(1500)).await;
        assert_eq!(clock.now(), anchor + Duration::milliseconds(1500));
    }
}
