//! Fire schedule — today's pending alarm rings, scoped by the job that planned them.
//!
//! Each daily run plans the day's fires under its job name. Clearing is always
//! per scope, so other jobs sharing the table keep their entries.

use std::path::Path;
use std::sync::Mutex;

use chrono::{NaiveDateTime, Utc};
use eruna_core::{ErunaError, Result};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

/// Scheduled work that a trigger clears before planning a new day.
pub trait PendingWork: Send + Sync {
    /// Remove every pending entry owned by `scope`. Returns how many were removed.
    fn clear_scope(&self, scope: &str) -> Result<usize>;
}

/// One planned alarm ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledFire {
    pub scope: String,
    pub alarm_id: i64,
    pub group_id: i64,
    /// Local wall-clock time of the ring.
    pub fire_at: NaiveDateTime,
}

/// SQLite-backed fire schedule.
pub struct FireSchedule {
    conn: Mutex<Connection>,
}

fn sched_err(e: impl std::fmt::Display) -> ErunaError {
    ErunaError::Dispatch(format!("fire schedule: {e}"))
}

const FIRE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

impl FireSchedule {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(sched_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sched_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scheduled_fire (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                alarm_id INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                fire_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (scope, alarm_id, fire_at)
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_fire_scope ON scheduled_fire(scope, fire_at);
            ",
        )
        .map_err(sched_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Plan a ring. Returns false when the same ring is already planned.
    pub fn schedule(&self, fire: &ScheduledFire) -> Result<bool> {
        let conn = self.conn.lock().map_err(sched_err)?;
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO scheduled_fire (scope, alarm_id, group_id, fire_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fire.scope,
                    fire.alarm_id,
                    fire.group_id,
                    fire.fire_at.format(FIRE_FORMAT).to_string(),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(sched_err)?;
        Ok(n > 0)
    }

    /// Pending rings of a scope, earliest first.
    pub fn pending(&self, scope: &str) -> Result<Vec<ScheduledFire>> {
        let conn = self.conn.lock().map_err(sched_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT scope, alarm_id, group_id, fire_at FROM scheduled_fire
                 WHERE scope = ?1 ORDER BY fire_at, alarm_id",
            )
            .map_err(sched_err)?;
        let rows = stmt
            .query_map([scope], |row| {
                let fire_at: String = row.get(3)?;
                Ok(ScheduledFire {
                    scope: row.get(0)?,
                    alarm_id: row.get(1)?,
                    group_id: row.get(2)?,
                    fire_at: NaiveDateTime::parse_from_str(&fire_at, FIRE_FORMAT)
                        .unwrap_or_default(),
                })
            })
            .map_err(sched_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sched_err)
    }
}

impl PendingWork for FireSchedule {
    fn clear_scope(&self, scope: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(sched_err)?;
        let n = conn
            .execute("DELETE FROM scheduled_fire WHERE scope = ?1", [scope])
            .map_err(sched_err)?;
        tracing::debug!(scope, removed = n, "cleared pending fires");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fire(scope: &str, alarm_id: i64, hour: u32) -> ScheduledFire {
        ScheduledFire {
            scope: scope.into(),
            alarm_id,
            group_id: alarm_id * 10,
            fire_at: NaiveDate::from_ymd_opt(2026, 10, 19)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
        }
    }

    #[test]
    fn test_schedule_is_idempotent_per_ring() {
        let sched = FireSchedule::open_in_memory().unwrap();
        assert!(sched.schedule(&fire("readAlarmsJob", 1, 7)).unwrap());
        assert!(!sched.schedule(&fire("readAlarmsJob", 1, 7)).unwrap());
        assert_eq!(sched.pending("readAlarmsJob").unwrap().len(), 1);
    }

    #[test]
    fn test_clear_scope_leaves_other_scopes() {
        let sched = FireSchedule::open_in_memory().unwrap();
        sched.schedule(&fire("readAlarmsJob", 2, 8)).unwrap();
        sched.schedule(&fire("readAlarmsJob", 1, 7)).unwrap();
        sched.schedule(&fire("reminders", 3, 9)).unwrap();

        let pending = sched.pending("readAlarmsJob").unwrap();
        assert_eq!(pending[0].alarm_id, 1);
        assert_eq!(pending[1].alarm_id, 2);

        assert_eq!(sched.clear_scope("readAlarmsJob").unwrap(), 2);
        assert!(sched.pending("readAlarmsJob").unwrap().is_empty());
        assert_eq!(sched.pending("reminders").unwrap(), vec![fire("reminders", 3, 9)]);
    }
}
