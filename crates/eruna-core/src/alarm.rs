//! Alarm domain types.
//!
//! Alarms and their day-of-week associations are owned by the application
//! database. The batch only reads them and hands references to the writer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ErunaError;

/// Fixed seven-symbol day vocabulary. The upper-case token is the persisted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Week {
    #[serde(rename = "MON")]
    Mon,
    #[serde(rename = "TUE")]
    Tue,
    #[serde(rename = "WED")]
    Wed,
    #[serde(rename = "THU")]
    Thu,
    #[serde(rename = "FRI")]
    Fri,
    #[serde(rename = "SAT")]
    Sat,
    #[serde(rename = "SUN")]
    Sun,
}

impl Week {
    pub const ALL: [Week; 7] = [
        Week::Mon,
        Week::Tue,
        Week::Wed,
        Week::Thu,
        Week::Fri,
        Week::Sat,
        Week::Sun,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Week::Mon => "MON",
            Week::Tue => "TUE",
            Week::Wed => "WED",
            Week::Thu => "THU",
            Week::Fri => "FRI",
            Week::Sat => "SAT",
            Week::Sun => "SUN",
        }
    }

    /// Days since Monday (MON = 0 .. SUN = 6).
    pub fn ordinal(&self) -> u32 {
        Weekday::from(*self).num_days_from_monday()
    }
}

impl From<Weekday> for Week {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => Week::Mon,
            Weekday::Tue => Week::Tue,
            Weekday::Wed => Week::Wed,
            Weekday::Thu => Week::Thu,
            Weekday::Fri => Week::Fri,
            Weekday::Sat => Week::Sat,
            Weekday::Sun => Week::Sun,
        }
    }
}

impl From<Week> for Weekday {
    fn from(day: Week) -> Self {
        match day {
            Week::Mon => Weekday::Mon,
            Week::Tue => Weekday::Tue,
            Week::Wed => Weekday::Wed,
            Week::Thu => Weekday::Thu,
            Week::Fri => Weekday::Fri,
            Week::Sat => Weekday::Sat,
            Week::Sun => Weekday::Sun,
        }
    }
}

impl fmt::Display for Week {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Week {
    type Err = ErunaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Week::ALL
            .into_iter()
            .find(|w| w.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ErunaError::Store(format!("unknown day-of-week token '{s}'")))
    }
}

/// An alarm as seen by the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// Stable identifier; also the paging sort key.
    pub id: i64,
    pub label: String,
    /// Local wall-clock time the alarm rings.
    pub alarm_time: NaiveTime,
    /// Recurrence days. Empty means the alarm never fires.
    pub days: Vec<Week>,
    pub created_at: DateTime<Utc>,
}

impl Alarm {
    pub fn new(id: i64, label: &str, alarm_time: NaiveTime, days: &[Week]) -> Self {
        let mut days = days.to_vec();
        days.sort();
        days.dedup();
        Self {
            id,
            label: label.to_string(),
            alarm_time,
            days,
            created_at: Utc::now(),
        }
    }

    /// Whether the alarm recurs on `day`.
    pub fn fires_on(&self, day: Week) -> bool {
        self.days.contains(&day)
    }
}

/// One `(alarm_id, day)` association row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayOfWeekAssociation {
    pub alarm_id: i64,
    pub day: Week,
}

/// Group an alarm belongs to, as resolved by the grouping store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    pub id: i64,
    /// Shareable join code.
    pub code: String,
    pub alarm_id: i64,
}
