//! Lightweight cron expression parser.
//! Supports: "SEC MIN HOUR DOM MON DOW" (6-field) and "MIN HOUR DOM MON DOW" (5-field, seconds = 0)
//! Fields: *, ?, */N, N, A-B, A-B/N, comma lists. DOW takes 0-7 (0 and 7 = Sunday) or MON..SUN.
//! Example: "0 0 0 * * *" = every day at midnight
//!
//! When both DOM and DOW are restricted, a date must satisfy both.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use eruna_core::{ErunaError, Result};

const DOW_NAMES: [(&str, u32); 7] = [
    ("SUN", 0),
    ("MON", 1),
    ("TUE", 2),
    ("WED", 3),
    ("THU", 4),
    ("FRI", 5),
    ("SAT", 6),
];

/// Longest look-ahead when searching for the next fire time: four years, so
/// a 29 February schedule still finds its next leap day.
const MAX_LOOKAHEAD_DAYS: i64 = 366 * 4;

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: Vec<u32>,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday .. 6 = Saturday.
    days_of_week: Vec<u32>,
}

impl CronSchedule {
    /// Parse a 5- or 6-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        let (sec, rest) = match parts.len() {
            6 => (parts[0], &parts[1..]),
            5 => ("0", &parts[..]),
            n => {
                return Err(ErunaError::Cron(format!(
                    "'{expression}' has {n} fields (need SEC MIN HOUR DOM MON DOW)"
                )));
            }
        };

        let invalid = |field: &str| ErunaError::Cron(format!("'{expression}': bad field '{field}'"));

        let seconds = parse_field(sec, 0, 59, &[]).ok_or_else(|| invalid(sec))?;
        let minutes = parse_field(rest[0], 0, 59, &[]).ok_or_else(|| invalid(rest[0]))?;
        let hours = parse_field(rest[1], 0, 23, &[]).ok_or_else(|| invalid(rest[1]))?;
        let days_of_month = parse_field(rest[2], 1, 31, &[]).ok_or_else(|| invalid(rest[2]))?;
        let months = parse_field(rest[3], 1, 12, &[]).ok_or_else(|| invalid(rest[3]))?;
        let mut days_of_week =
            parse_field(rest[4], 0, 7, &DOW_NAMES).ok_or_else(|| invalid(rest[4]))?;
        for d in days_of_week.iter_mut() {
            if *d == 7 {
                *d = 0;
            }
        }
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Ok(Self {
            expression: expression.to_string(),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.months.contains(&date.month())
            && self.days_of_month.contains(&date.day())
            && self
                .days_of_week
                .contains(&date.weekday().num_days_from_sunday())
    }

    /// Whether `instant` (to the second) is a fire time.
    pub fn matches<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> bool {
        self.date_matches(instant.date_naive())
            && self.hours.contains(&instant.hour())
            && self.minutes.contains(&instant.minute())
            && self.seconds.contains(&instant.second())
    }

    /// First fire time strictly after `after`, evaluated in `after`'s time zone.
    /// Local times skipped by a DST gap are not fire times.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let start = after.date_naive();

        for offset in 0..MAX_LOOKAHEAD_DAYS {
            let date = start.checked_add_signed(Duration::days(offset))?;
            if !self.date_matches(date) {
                continue;
            }
            for &h in &self.hours {
                for &m in &self.minutes {
                    for &s in &self.seconds {
                        let Some(naive) = date.and_hms_opt(h, m, s) else {
                            continue;
                        };
                        let Some(candidate) = tz.from_local_datetime(&naive).earliest() else {
                            continue;
                        };
                        if candidate > *after {
                            return Some(candidate);
                        }
                    }
                }
            }
        }

        None
    }
}

/// Parse a cron expression and compute the next run time in UTC.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::parse(expression) {
        Ok(schedule) => schedule.next_after(&after),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    }
}

/// Parse a cron field into a sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32, names: &[(&str, u32)]) -> Option<Vec<u32>> {
    let mut values = Vec::new();

    for part in field.split(',') {
        let part = part.trim();
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step.parse().ok()?;
                if n == 0 {
                    return None;
                }
                (range, Some(n))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let n = parse_value(range, names)?;
            // "N/step" runs from N to the end of the range
            if step.is_some() { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max || lo > hi {
            return None;
        }
        values.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() { None } else { Some(values) }
}

fn parse_value(token: &str, names: &[(&str, u32)]) -> Option<u32> {
    let token = token.trim();
    token.parse().ok().or_else(|| {
        names
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, v)| *v)
    })
}
