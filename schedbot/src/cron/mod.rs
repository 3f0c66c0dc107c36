// Cron expression parsing and next fire time search
//
// Six or seven whitespace separated fields:
//
//   seconds minutes hours day-of-month month day-of-week [year]
//
// with the special characters `* , - / ? L W #`. Exactly one of the two day
// fields must be `?` when the other one is constrained.

mod field;

use crate::errors::ScheduleError;
use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, SubsecRound, TimeZone,
    Timelike, Utc,
};
use field::{DayOfMonth, DayOfWeek};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How far ahead the search looks before giving up
pub const MAX_LOOKAHEAD_YEARS: i32 = 5;

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: DayOfMonth,
    months: BTreeSet<u32>,
    days_of_week: DayOfWeek,
    years: Option<BTreeSet<u32>>,
}

impl CronExpression {
    /// Parse an expression, reporting the offending field on failure
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };

        let normalized = expression.trim().to_ascii_uppercase();
        let fields: Vec<&str> = normalized.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(invalid(format!(
                "expected 6 or 7 fields, found {}",
                fields.len()
            )));
        }

        let seconds = field::parse_values(fields[0], &field::SECONDS).map_err(invalid)?;
        let minutes = field::parse_values(fields[1], &field::MINUTES).map_err(invalid)?;
        let hours = field::parse_values(fields[2], &field::HOURS).map_err(invalid)?;
        let days_of_month = DayOfMonth::parse(fields[3]).map_err(invalid)?;
        let months = field::parse_values(fields[4], &field::MONTHS).map_err(invalid)?;
        let days_of_week = DayOfWeek::parse(fields[5]).map_err(invalid)?;
        let years = match fields.get(6) {
            None | Some(&"*") => None,
            Some(years) => Some(field::parse_values(years, &field::YEARS).map_err(invalid)?),
        };

        match (&days_of_month, &days_of_week) {
            (DayOfMonth::Unspecified, DayOfWeek::Unspecified) => {
                return Err(invalid(
                    "'?' may only be used in one of day-of-month and day-of-week".to_string(),
                ));
            }
            (dom, dow) if dom.is_constrained() && !matches!(dow, DayOfWeek::Unspecified) => {
                return Err(invalid(
                    "day-of-week must be '?' when day-of-month is specified".to_string(),
                ));
            }
            (dom, dow) if dow.is_constrained() && !matches!(dom, DayOfMonth::Unspecified) => {
                return Err(invalid(
                    "day-of-month must be '?' when day-of-week is specified".to_string(),
                ));
            }
            _ => {}
        }

        Ok(Self {
            source: expression.trim().to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            years,
        })
    }

    /// The expression as it was written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Next fire time strictly after `from`, evaluated in UTC
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.next_after_in(from, &Utc)
    }

    /// Next fire time strictly after `from`, with the fields evaluated as
    /// local time of `timezone`.
    ///
    /// Local times skipped by a daylight-saving transition never fire; a
    /// repeated local time fires at its earliest instant only.
    pub fn next_after_in<Tz: TimeZone>(
        &self,
        from: DateTime<Utc>,
        timezone: &Tz,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let local_from = from.with_timezone(timezone).naive_local();
        let limit_year = local_from.year() + MAX_LOOKAHEAD_YEARS;
        let mut cursor = local_from.trunc_subsecs(0) + Duration::seconds(1);

        loop {
            let candidate =
                self.next_local(cursor, limit_year)
                    .ok_or_else(|| ScheduleError::NoMatch {
                        expression: self.source.clone(),
                        lookahead_years: MAX_LOOKAHEAD_YEARS,
                    })?;

            match timezone.from_local_datetime(&candidate) {
                LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _)
                    if dt.with_timezone(&Utc) > from =>
                {
                    return Ok(dt.with_timezone(&Utc));
                }
                _ => cursor = candidate + Duration::seconds(1),
            }
        }
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        self.days_of_month.matches(date) && self.days_of_week.matches(date)
    }

    /// First local time at or after `cursor` satisfying every field
    fn next_local(&self, mut cursor: NaiveDateTime, limit_year: i32) -> Option<NaiveDateTime> {
        loop {
            if cursor.year() > limit_year {
                return None;
            }

            if let Some(years) = &self.years {
                let year = u32::try_from(cursor.year()).ok()?;
                match years.range(year..).next() {
                    Some(&y) if y == year => {}
                    Some(&y) => {
                        cursor = start_of_month(i32::try_from(y).ok()?, 1)?;
                        continue;
                    }
                    None => return None,
                }
            }

            match self.months.range(cursor.month()..).next() {
                Some(&m) if m == cursor.month() => {}
                Some(&m) => {
                    cursor = start_of_month(cursor.year(), m)?;
                    continue;
                }
                None => {
                    cursor = start_of_month(cursor.year() + 1, 1)?;
                    continue;
                }
            }

            let date = cursor.date();
            if !self.day_matches(date) {
                cursor = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            match self.hours.range(cursor.hour()..).next() {
                Some(&h) if h == cursor.hour() => {}
                Some(&h) => {
                    cursor = date.and_hms_opt(h, 0, 0)?;
                    continue;
                }
                None => {
                    cursor = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                    continue;
                }
            }

            match self.minutes.range(cursor.minute()..).next() {
                Some(&m) if m == cursor.minute() => {}
                Some(&m) => {
                    cursor = date.and_hms_opt(cursor.hour(), m, 0)?;
                    continue;
                }
                None => {
                    cursor = date.and_hms_opt(cursor.hour(), 0, 0)? + Duration::hours(1);
                    continue;
                }
            }

            match self.seconds.range(cursor.second()..).next() {
                Some(&s) if s == cursor.second() => {}
                Some(&s) => {
                    cursor = date.and_hms_opt(cursor.hour(), cursor.minute(), s)?;
                    continue;
                }
                None => {
                    cursor = date.and_hms_opt(cursor.hour(), cursor.minute(), 0)?
                        + Duration::minutes(1);
                    continue;
                }
            }

            return Some(cursor);
        }
    }
}

fn start_of_month(year: i32, month: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronExpression, ScheduleError> {
    CronExpression::parse(expression)
}

/// Next fire time of `expression` strictly after `from`, in UTC
pub fn next_after(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
    CronExpression::parse(expression)?.next_after(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn next(expression: &str, from: DateTime<Utc>) -> DateTime<Utc> {
        next_after(expression, from).unwrap()
    }

    #[test]
    fn test_every_minute_from_half_second() {
        let from = utc(2024, 6, 1, 12, 0, 0) + Duration::milliseconds(500);
        assert_eq!(next("0 * * * * ?", from), utc(2024, 6, 1, 12, 1, 0));
    }

    #[test]
    fn test_strictly_after_exact_match() {
        let from = utc(2024, 6, 1, 12, 1, 0);
        assert_eq!(next("0 * * * * ?", from), utc(2024, 6, 1, 12, 2, 0));
    }

    #[test]
    fn test_noon_daily() {
        assert_eq!(
            next("0 0 12 * * ?", utc(2024, 6, 1, 9, 30, 0)),
            utc(2024, 6, 1, 12, 0, 0)
        );
        assert_eq!(
            next("0 0 12 * * ?", utc(2024, 6, 1, 12, 0, 0)),
            utc(2024, 6, 2, 12, 0, 0)
        );
        assert_eq!(
            next("0 0 12 * * ?", utc(2024, 6, 30, 13, 0, 0)),
            utc(2024, 7, 1, 12, 0, 0)
        );
    }

    #[test]
    fn test_both_day_fields_star_means_every_day() {
        assert_eq!(
            next("0 0 12 * * *", utc(2024, 6, 1, 13, 0, 0)),
            utc(2024, 6, 2, 12, 0, 0)
        );
    }

    #[test]
    fn test_stepped_seconds() {
        assert_eq!(
            next("0/15 * * * * ?", utc(2024, 6, 1, 12, 0, 16)),
            utc(2024, 6, 1, 12, 0, 30)
        );
        assert_eq!(
            next("0/15 * * * * ?", utc(2024, 6, 1, 12, 0, 50)),
            utc(2024, 6, 1, 12, 1, 0)
        );
    }

    #[test]
    fn test_carry_across_year_boundary() {
        assert_eq!(
            next("0 0 0 1 1 ?", utc(2024, 6, 1, 0, 0, 0)),
            utc(2025, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            next("59 59 23 31 12 ?", utc(2024, 12, 31, 23, 59, 59)),
            utc(2025, 12, 31, 23, 59, 59)
        );
    }

    #[test]
    fn test_last_day_of_february() {
        assert_eq!(
            next("0 0 0 L 2 ?", utc(2023, 3, 1, 0, 0, 0)),
            utc(2024, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn test_last_day_offsets() {
        assert_eq!(
            next("0 0 0 L-3 * ?", utc(2024, 6, 1, 0, 0, 0)),
            utc(2024, 6, 27, 0, 0, 0)
        );
        assert_eq!(
            next("0 0 0 LW * ?", utc(2024, 6, 1, 0, 0, 0)),
            utc(2024, 6, 28, 0, 0, 0)
        );
    }

    #[test]
    fn test_nearest_weekday() {
        assert_eq!(
            next("0 0 9 15W * ?", utc(2024, 6, 1, 0, 0, 0)),
            utc(2024, 6, 14, 9, 0, 0)
        );
        assert_eq!(
            next("0 0 9 1W * ?", utc(2024, 5, 31, 12, 0, 0)),
            utc(2024, 6, 3, 9, 0, 0)
        );
    }

    #[test]
    fn test_weekday_specials() {
        assert_eq!(
            next("0 0 0 ? * 6L", utc(2024, 6, 1, 0, 0, 0)),
            utc(2024, 6, 28, 0, 0, 0)
        );
        assert_eq!(
            next("0 0 0 ? * 5#2", utc(2024, 6, 1, 0, 0, 0)),
            utc(2024, 6, 13, 0, 0, 0)
        );
        assert_eq!(
            next("0 0 0 ? * L", utc(2024, 6, 3, 10, 0, 0)),
            utc(2024, 6, 8, 0, 0, 0)
        );
    }

    #[test]
    fn test_nth_weekday_overflow_moves_to_later_month() {
        // June 2024 has only four Mondays; July 29th is the next fifth Monday
        assert_eq!(
            next("0 0 0 ? * 2#5", utc(2024, 6, 1, 0, 0, 0)),
            utc(2024, 7, 29, 0, 0, 0)
        );
    }

    #[test]
    fn test_names_and_wrapping_ranges() {
        // 2024-06-04 is a Tuesday
        assert_eq!(
            next("0 0 0 ? * FRI-MON", utc(2024, 6, 4, 12, 0, 0)),
            utc(2024, 6, 7, 0, 0, 0)
        );
        assert_eq!(
            next("0 30 8 ? JUL mon", utc(2024, 6, 4, 12, 0, 0)),
            utc(2024, 7, 1, 8, 30, 0)
        );
    }

    #[test]
    fn test_year_field() {
        assert_eq!(
            next("0 0 0 1 1 ? 2026-2028", utc(2024, 6, 1, 0, 0, 0)),
            utc(2026, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            next("0 0 0 1 1 ? *", utc(2024, 6, 1, 0, 0, 0)),
            utc(2025, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_no_match_within_lookahead() {
        let err = next_after("0 0 0 30 2 ?", utc(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, ScheduleError::NoMatch { .. }));

        let err = next_after("0 0 0 1 1 ? 2020", utc(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, ScheduleError::NoMatch { .. }));

        let err = next_after("0 0 0 1 1 ? 2035", utc(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, ScheduleError::NoMatch { .. }));
    }

    #[test]
    fn test_invalid_expressions() {
        let invalid = [
            "",
            "* * * * *",
            "* * * * * ? 2024 1",
            "60 * * * * ?",
            "* 60 * * * ?",
            "* * 24 * * ?",
            "* * * 32 * ?",
            "* * * * 13 ?",
            "* * * ? * 8",
            "* * * 15 * MON",
            "* * * 15 * *",
            "* * * * * MON",
            "* * * ? * ?",
            "0 0 0 ? * 2#6",
            "0 0 0 L,15 * ?",
            "*/0 * * * * ?",
            "abc * * * * ?",
            "0 0 0 1 1 ? 1969",
        ];
        for expression in invalid {
            let result = parse_cron_expression(expression);
            assert!(
                matches!(result, Err(ScheduleError::InvalidCronExpression { .. })),
                "expected '{}' to be rejected",
                expression
            );
        }
    }

    #[test]
    fn test_timezone_evaluation() {
        let expression = CronExpression::parse("0 0 12 * * ?").unwrap();
        let tz = chrono_tz::Asia::Ho_Chi_Minh;
        let next = expression
            .next_after_in(utc(2024, 6, 1, 0, 0, 0), &tz)
            .unwrap();
        assert_eq!(next, utc(2024, 6, 1, 5, 0, 0));
    }

    #[test]
    fn test_daylight_saving_gap_is_skipped() {
        // 02:30 does not exist in New York on 2024-03-10
        let expression = CronExpression::parse("0 30 2 * * ?").unwrap();
        let tz = chrono_tz::America::New_York;
        let next = expression
            .next_after_in(utc(2024, 3, 9, 17, 0, 0), &tz)
            .unwrap();
        assert_eq!(next, utc(2024, 3, 11, 6, 30, 0));
    }

    #[test]
    fn test_display_and_from_str() {
        let expression: CronExpression = " 0 * * * * ? ".parse().unwrap();
        assert_eq!(expression.to_string(), "0 * * * * ?");
        assert_eq!(expression.as_str(), "0 * * * * ?");
    }
}
