//! Reduced five-field cron grammar and next-occurrence math.
//!
//! An expression is `minute hour day-of-month month day-of-week`, each field
//! either `*` or a single integer in its domain. Lists, ranges and steps are
//! not supported.
//!
//! Day matching follows Vixie cron: when both day-of-month and day-of-week are
//! restricted a day matches if EITHER field does; otherwise only the
//! restricted field (if any) has to match. Everything is evaluated in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// How far ahead `next_due_after` searches. A Feb 29 schedule can go 8 years
/// between matches (2096 → 2104).
const SEARCH_HORIZON_YEARS: i32 = 9;

/// One position of a recurrence expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// `*`
    Any,
    /// A single fixed value.
    At(u32),
}

impl Field {
    pub fn matches(self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::At(v) => v == value,
        }
    }

    pub fn is_restricted(self) -> bool {
        matches!(self, Field::At(_))
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Any => write!(f, "*"),
            Field::At(v) => write!(f, "{v}"),
        }
    }
}

/// A parsed, validated recurrence expression.
///
/// Only constructible through [`Recurrence::parse`], so every value held by a
/// task is known to have a future occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Recurrence {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    /// 0 = Sunday … 6 = Saturday.
    day_of_week: Field,
}

impl Recurrence {
    /// Parse and validate an expression such as `"0 3 * * *"`.
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| SchedulerError::InvalidRecurrence {
            expression: expression.to_string(),
            reason,
        };

        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", parts.len())));
        }

        let field = |idx: usize, name: &str, min: u32, max: u32| -> Result<Field> {
            let raw = parts[idx];
            if raw == "*" {
                return Ok(Field::Any);
            }
            if !raw.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid(format!(
                    "{name} must be '*' or a plain integer, got '{raw}'"
                )));
            }
            let value: u32 = raw
                .parse()
                .map_err(|_| invalid(format!("{name} value '{raw}' is out of range")))?;
            if value < min || value > max {
                return Err(invalid(format!("{name} must be within {min}-{max}, got {value}")));
            }
            Ok(Field::At(value))
        };

        let recurrence = Recurrence {
            minute: field(0, "minute", 0, 59)?,
            hour: field(1, "hour", 0, 23)?,
            day_of_month: field(2, "day-of-month", 1, 31)?,
            month: field(3, "month", 1, 12)?,
            day_of_week: field(4, "day-of-week", 0, 6)?,
        };

        // A fixed day-of-month past the end of a fixed month never fires,
        // unless a restricted day-of-week can still match on its own.
        if let (Field::At(day), Field::At(month), Field::Any) =
            (recurrence.day_of_month, recurrence.month, recurrence.day_of_week)
        {
            if day > max_days_in_month(month) {
                return Err(invalid(format!("month {month} never has a day {day}")));
            }
        }

        Ok(recurrence)
    }

    /// Smallest whole-minute instant strictly after `reference` that matches
    /// every field.
    ///
    /// Returns `None` only when the search would leave chrono's supported date
    /// range; validated expressions otherwise always have an answer inside
    /// the search horizon.
    pub fn next_due_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = reference.naive_utc().with_second(0)?.with_nanosecond(0)?;
        let mut t = floor.checked_add_signed(Duration::minutes(1))?;
        let horizon = t.year().checked_add(SEARCH_HORIZON_YEARS)?;

        while t.year() <= horizon {
            if !self.month.matches(t.month()) {
                t = start_of_next_month(t.date())?;
            } else if !self.matches_day(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
            } else if !self.hour.matches(t.hour()) {
                t = t
                    .date()
                    .and_hms_opt(t.hour(), 0, 0)?
                    .checked_add_signed(Duration::hours(1))?;
            } else if !self.minute.matches(t.minute()) {
                t = t.checked_add_signed(Duration::minutes(1))?;
            } else {
                return Some(Utc.from_utc_datetime(&t));
            }
        }
        None
    }

    /// Whether `at` (truncated to the minute) is an occurrence.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.month.matches(at.month())
            && self.matches_day(at.date_naive())
    }

    fn matches_day(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());
        if self.day_of_month.is_restricted() && self.day_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl std::fmt::Display for Recurrence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

impl std::str::FromStr for Recurrence {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Recurrence::parse(s)
    }
}

impl TryFrom<String> for Recurrence {
    type Error = SchedulerError;

    fn try_from(s: String) -> Result<Self> {
        Recurrence::parse(&s)
    }
}

impl From<Recurrence> for String {
    fn from(r: Recurrence) -> Self {
        r.to_string()
    }
}

fn max_days_in_month(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

fn start_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year().checked_add(1)?, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}
