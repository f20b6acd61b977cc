//! Today's day-of-week token, used as the reader's query parameter.

use chrono::{DateTime, Datelike, FixedOffset, Local, NaiveDate, Utc};
use eruna_core::Week;

/// Map a calendar date to the fixed seven-symbol vocabulary.
pub fn today_for(date: NaiveDate) -> Week {
    Week::from(date.weekday())
}

/// First date on or after `from` that falls on `day`.
pub fn ring_date(day: Week, from: NaiveDate) -> NaiveDate {
    from.iter_days()
        .take(7)
        .find(|d| today_for(*d) == day)
        .unwrap_or(from)
}

/// How "today" is resolved from an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayClock {
    /// Host local time zone.
    Local,
    /// Fixed offset from UTC, in minutes.
    Offset(i32),
}

impl DayClock {
    pub fn from_offset_minutes(offset: Option<i32>) -> Self {
        offset.map(DayClock::Offset).unwrap_or(DayClock::Local)
    }

    /// Calendar date of `instant` under this clock.
    pub fn date_at(&self, instant: DateTime<Utc>) -> NaiveDate {
        match self {
            DayClock::Local => instant.with_timezone(&Local).date_naive(),
            DayClock::Offset(minutes) => match FixedOffset::east_opt(minutes.saturating_mul(60)) {
                Some(offset) => instant.with_timezone(&offset).date_naive(),
                None => instant.date_naive(),
            },
        }
    }

    /// Day-of-week token of `instant` under this clock.
    pub fn day_at(&self, instant: DateTime<Utc>) -> Week {
        today_for(self.date_at(instant))
    }

    /// Day-of-week token for the current instant.
    pub fn today(&self) -> Week {
        let day = self.day_at(Utc::now());
        tracing::info!(today = %day, "computed today");
        day
    }
}
