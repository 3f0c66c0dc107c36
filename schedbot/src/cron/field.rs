// Parsing of individual cron fields and day-matching rules

use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::BTreeSet;

/// Value domain of one cron field
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldKind {
    pub name: &'static str,
    pub min: u32,
    pub max: u32,
    /// Symbolic names, the first one mapping to `min`
    pub names: &'static [&'static str],
}

pub(crate) const SECONDS: FieldKind = FieldKind {
    name: "seconds",
    min: 0,
    max: 59,
    names: &[],
};

pub(crate) const MINUTES: FieldKind = FieldKind {
    name: "minutes",
    min: 0,
    max: 59,
    names: &[],
};

pub(crate) const HOURS: FieldKind = FieldKind {
    name: "hours",
    min: 0,
    max: 23,
    names: &[],
};

pub(crate) const DAYS_OF_MONTH: FieldKind = FieldKind {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};

pub(crate) const MONTHS: FieldKind = FieldKind {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};

pub(crate) const DAYS_OF_WEEK: FieldKind = FieldKind {
    name: "day-of-week",
    min: 1,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

pub(crate) const YEARS: FieldKind = FieldKind {
    name: "year",
    min: 1970,
    max: 2099,
    names: &[],
};

/// Parse a single value, numeric or symbolic
fn parse_value(token: &str, kind: &FieldKind) -> Result<u32, String> {
    let value = match token.parse::<u32>() {
        Ok(v) => v,
        Err(_) => kind
            .names
            .iter()
            .position(|name| *name == token)
            .map(|idx| kind.min + idx as u32)
            .ok_or_else(|| format!("'{}' is not a valid {} value", token, kind.name))?,
    };

    if value < kind.min || value > kind.max {
        return Err(format!(
            "{} value {} out of range {}-{}",
            kind.name, value, kind.min, kind.max
        ));
    }
    Ok(value)
}

fn parse_step(token: &str, kind: &FieldKind) -> Result<usize, String> {
    let span = kind.max - kind.min + 1;
    match token.parse::<u32>() {
        Ok(step) if step >= 1 && step <= span => Ok(step as usize),
        _ => Err(format!(
            "{} step '{}' must be between 1 and {}",
            kind.name, token, span
        )),
    }
}

/// Parse a list of `*`, values, ranges and stepped ranges into the set of
/// matching values. A range whose start exceeds its end wraps around the
/// field's maximum (`FRI-MON`).
pub(crate) fn parse_values(field: &str, kind: &FieldKind) -> Result<BTreeSet<u32>, String> {
    let mut values = BTreeSet::new();

    for item in field.split(',') {
        if item.is_empty() {
            return Err(format!("empty list item in {} field", kind.name));
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, parse_step(step, kind)?),
            None => (item, 1),
        };
        let stepped = item.contains('/');

        let (start, end) = if range == "*" {
            (kind.min, kind.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, kind)?, parse_value(b, kind)?)
        } else {
            let v = parse_value(range, kind)?;
            // `a/n` runs from `a` to the end of the field
            (v, if stepped { kind.max } else { v })
        };

        if start <= end {
            values.extend((start..=end).step_by(step));
        } else {
            values.extend((start..=kind.max).chain(kind.min..=end).step_by(step));
        }
    }

    Ok(values)
}

/// Last calendar day of the given month
pub(crate) fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Day-of-week number with Sunday = 1 and Saturday = 7
fn weekday_number(date: NaiveDate) -> u32 {
    date.weekday().number_from_sunday()
}

/// Day-of-month constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DayOfMonth {
    /// `*`
    Any,
    /// `?`
    Unspecified,
    Days(BTreeSet<u32>),
    /// `L` or `L-n`
    Last { offset: u32 },
    /// `LW`
    LastWeekday,
    /// `nW`
    NearestWeekday(u32),
}

impl DayOfMonth {
    pub fn parse(field: &str) -> Result<Self, String> {
        match field {
            "*" => return Ok(Self::Any),
            "?" => return Ok(Self::Unspecified),
            "L" => return Ok(Self::Last { offset: 0 }),
            "LW" => return Ok(Self::LastWeekday),
            _ => {}
        }

        if let Some(offset) = field.strip_prefix("L-") {
            return match offset.parse::<u32>() {
                Ok(n) if (1..=30).contains(&n) => Ok(Self::Last { offset: n }),
                _ => Err(format!("'L-{}' offset must be between 1 and 30", offset)),
            };
        }

        if let Some(day) = field.strip_suffix('W') {
            if day.contains([',', '-', '/', '*']) {
                return Err("'W' can only be combined with a single day".to_string());
            }
            return Ok(Self::NearestWeekday(parse_value(day, &DAYS_OF_MONTH)?));
        }

        if field.contains(['L', 'W', '#', '?']) {
            return Err(format!(
                "'{}' mixes special characters into a day-of-month list",
                field
            ));
        }

        Ok(Self::Days(parse_values(field, &DAYS_OF_MONTH)?))
    }

    /// Whether the field restricts days (anything but `*` and `?`)
    pub fn is_constrained(&self) -> bool {
        !matches!(self, Self::Any | Self::Unspecified)
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        let day = date.day();
        let last = last_day_of_month(date.year(), date.month());

        match self {
            Self::Any | Self::Unspecified => true,
            Self::Days(days) => days.contains(&day),
            Self::Last { offset } => *offset < last && day == last - offset,
            Self::LastWeekday => {
                let last_date = date.with_day(last).unwrap_or(date);
                let target = match last_date.weekday() {
                    Weekday::Sat => last - 1,
                    Weekday::Sun => last - 2,
                    _ => last,
                };
                day == target
            }
            Self::NearestWeekday(wanted) => {
                if *wanted > last {
                    return false;
                }
                let Some(wanted_date) = date.with_day(*wanted) else {
                    return false;
                };
                // Never crosses into a neighbouring month
                let target = match wanted_date.weekday() {
                    Weekday::Sat if *wanted == 1 => wanted + 2,
                    Weekday::Sat => wanted - 1,
                    Weekday::Sun if *wanted == last => wanted - 2,
                    Weekday::Sun => wanted + 1,
                    _ => *wanted,
                };
                day == target
            }
        }
    }
}

/// Day-of-week constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DayOfWeek {
    /// `*`
    Any,
    /// `?`
    Unspecified,
    Days(BTreeSet<u32>),
    /// `nL`: last given weekday of the month
    LastOfMonth(u32),
    /// `d#n`: n-th given weekday of the month
    Nth { weekday: u32, nth: u32 },
}

impl DayOfWeek {
    pub fn parse(field: &str) -> Result<Self, String> {
        match field {
            "*" => return Ok(Self::Any),
            "?" => return Ok(Self::Unspecified),
            // Saturday closes the week
            "L" => return Ok(Self::Days(BTreeSet::from([7]))),
            _ => {}
        }

        if let Some((weekday, nth)) = field.split_once('#') {
            let weekday = parse_value(weekday, &DAYS_OF_WEEK)?;
            return match nth.parse::<u32>() {
                Ok(n) if (1..=5).contains(&n) => Ok(Self::Nth { weekday, nth: n }),
                _ => Err(format!("'#{}' occurrence must be between 1 and 5", nth)),
            };
        }

        if let Some(weekday) = field.strip_suffix('L') {
            return Ok(Self::LastOfMonth(parse_value(weekday, &DAYS_OF_WEEK)?));
        }

        if field.contains(['L', 'W', '#', '?']) {
            return Err(format!(
                "'{}' mixes special characters into a day-of-week list",
                field
            ));
        }

        Ok(Self::Days(parse_values(field, &DAYS_OF_WEEK)?))
    }

    pub fn is_constrained(&self) -> bool {
        !matches!(self, Self::Any | Self::Unspecified)
    }

    pub fn matches(&self, date: NaiveDate) -> bool {
        let weekday = weekday_number(date);

        match self {
            Self::Any | Self::Unspecified => true,
            Self::Days(days) => days.contains(&weekday),
            Self::LastOfMonth(wanted) => {
                *wanted == weekday
                    && date.day() + 7 > last_day_of_month(date.year(), date.month())
            }
            Self::Nth { weekday: wanted, nth } => {
                *wanted == weekday && (date.day() - 1) / 7 + 1 == *nth
            }
        }
    }
}
