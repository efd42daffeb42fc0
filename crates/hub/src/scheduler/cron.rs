//! Timezone-aware cron expressions (5-field: min hour dom month dow).
//!
//! Expressions are parsed once into a [`CronExpr`]; a malformed
//! expression is rejected at parse time instead of silently never
//! matching.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

use super::ScheduleError;

/// Parse a timezone string into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    /// `*/N`, stepping from the field's minimum value so 1-based
    /// fields (day-of-month, month) fire on 1, 1+N, 1+2N, ...
    Step { from: u32, step: u32 },
    /// Comma-separated values and `N-M` ranges.
    List(Vec<(u32, u32)>),
}

impl Field {
    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step { from, step } => value >= *from && (value - from) % step == 0,
            Field::List(ranges) => ranges.iter().any(|(lo, hi)| value >= *lo && value <= *hi),
        }
    }
}

fn parse_field(field: &str, min: u32, expr: &str) -> Result<Field, ScheduleError> {
    let bad = || ScheduleError::BadCron(expr.to_string());
    if field == "*" {
        return Ok(Field::Any);
    }
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().map_err(|_| bad())?;
        if n == 0 {
            return Err(bad());
        }
        return Ok(Field::Step { from: min, step: n });
    }
    let mut ranges = Vec::new();
    for part in field.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.parse().map_err(|_| bad())?;
                let hi: u32 = hi.parse().map_err(|_| bad())?;
                if lo > hi {
                    return Err(bad());
                }
                ranges.push((lo, hi));
            }
            None => {
                let n: u32 = part.parse().map_err(|_| bad())?;
                ranges.push((n, n));
            }
        }
    }
    Ok(Field::List(ranges))
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl FromStr for CronExpr {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields[..] else {
            return Err(ScheduleError::BadCron(s.to_string()));
        };
        Ok(Self {
            minute: parse_field(minute, 0, s)?,
            hour: parse_field(hour, 0, s)?,
            day_of_month: parse_field(dom, 1, s)?,
            month: parse_field(month, 1, s)?,
            day_of_week: parse_field(dow, 0, s)?,
        })
    }
}

impl CronExpr {
    fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }

    /// Whether the UTC instant falls on a matching minute, evaluated in
    /// the given timezone.
    pub fn matches(&self, at: &DateTime<Utc>, tz: chrono_tz::Tz) -> bool {
        self.matches_local(&at.with_timezone(&tz).naive_local())
    }

    /// Next occurrence strictly after `after`, evaluated in the given
    /// timezone, as a UTC instant.
    ///
    /// DST handling: local minutes inside a spring-forward gap are
    /// skipped; during a fall-back overlap the earliest (pre-transition)
    /// mapping is chosen.
    pub fn next_after(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        let to_next_minute = 60 - local_after.second() as i64;
        let mut candidate = local_after + chrono::Duration::seconds(to_next_minute);
        candidate = candidate.with_second(0).unwrap_or(candidate);

        // One year of minutes bounds the scan for expressions that can
        // never match (e.g. Feb 30).
        for _ in 0..(366 * 24 * 60) {
            if self.matches_local(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc));
                    }
                    chrono::LocalResult::None => {}
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}
