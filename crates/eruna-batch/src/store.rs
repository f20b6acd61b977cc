//! SQLite-backed alarm and group store.
//!
//! The alarm tables are read-only to the batch. Group rows are the only thing
//! the batch mutates, and only through the per-chunk unit of work:
//! `begin` opens a staging area, `resolve_or_create_group` stages new groups,
//! `commit` persists them in one SQLite transaction and `rollback` drops them.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use eruna_core::{Alarm, DayOfWeekAssociation, ErunaError, GroupRef, Result, Week};
use rusqlite::{Connection, OptionalExtension, params};

/// Query contract consumed from the alarm database.
pub trait AlarmStore: Send + Sync {
    /// Alarms whose day set contains `day`, id ascending, id > `after_id`, at most `limit`.
    fn alarms_for_day(&self, day: Week, after_id: Option<i64>, limit: usize) -> Result<Vec<Alarm>>;

    /// Raw association rows ordered by (alarm_id, day), strictly after `after`.
    fn associations(
        &self,
        after: Option<DayOfWeekAssociation>,
        limit: usize,
    ) -> Result<Vec<DayOfWeekAssociation>>;

    /// Load one alarm with its day set.
    fn find_alarm(&self, id: i64) -> Result<Option<Alarm>>;
}

/// Grouping collaborator used by the writer.
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn resolve_or_create_group(&self, alarm: &Alarm) -> Result<GroupRef>;
}

/// Transaction boundary around one chunk write.
pub trait ChunkTransaction: Send + Sync {
    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self);
}

/// Alarm + group store over a single SQLite connection.
pub struct SqliteAlarmStore {
    conn: Mutex<Connection>,
    /// Groups created by the open chunk; None outside a chunk.
    staged: Mutex<Option<Vec<StagedGroup>>>,
}

#[derive(Debug, Clone)]
struct StagedGroup {
    group: GroupRef,
    created_at: DateTime<Utc>,
}

fn unavailable(e: impl std::fmt::Display) -> ErunaError {
    ErunaError::SourceUnavailable(e.to_string())
}

fn store_err(e: impl std::fmt::Display) -> ErunaError {
    ErunaError::Store(e.to_string())
}

impl SqliteAlarmStore {
    /// Open or create the alarm database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| unavailable(format!("DB open: {e}")))?;
        // Ledger and fire schedule share this file.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();
        Self::with_connection(conn)
    }

    /// In-memory store, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
            staged: Mutex::new(None),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(unavailable)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS alarm (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                label TEXT NOT NULL DEFAULT '',
                alarm_time TEXT NOT NULL,        -- HH:MM:SS local time
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS day_of_week (
                alarm_id INTEGER NOT NULL REFERENCES alarm(id) ON DELETE CASCADE,
                day TEXT NOT NULL CHECK (day IN ('MON','TUE','WED','THU','FRI','SAT','SUN')),
                PRIMARY KEY (alarm_id, day)
            );
            CREATE INDEX IF NOT EXISTS idx_day_of_week_day ON day_of_week(day, alarm_id);

            CREATE TABLE IF NOT EXISTS alarm_group (
                id INTEGER PRIMARY KEY,
                alarm_id INTEGER NOT NULL UNIQUE,
                code TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| store_err(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Alarm seeding ──────────────────────────────────────

    /// Insert an alarm and its day associations.
    pub fn insert_alarm(&self, label: &str, alarm_time: NaiveTime, days: &[Week]) -> Result<Alarm> {
        let mut conn = self.conn.lock().map_err(store_err)?;
        let created_at = Utc::now();
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute(
            "INSERT INTO alarm (label, alarm_time, created_at) VALUES (?1, ?2, ?3)",
            params![
                label,
                alarm_time.format("%H:%M:%S").to_string(),
                created_at.to_rfc3339()
            ],
        )
        .map_err(|e| store_err(format!("Insert alarm: {e}")))?;
        let id = tx.last_insert_rowid();
        for day in days {
            tx.execute(
                "INSERT OR IGNORE INTO day_of_week (alarm_id, day) VALUES (?1, ?2)",
                params![id, day.as_str()],
            )
            .map_err(|e| store_err(format!("Insert day: {e}")))?;
        }
        tx.commit().map_err(store_err)?;

        let mut alarm = Alarm::new(id, label, alarm_time, days);
        alarm.created_at = created_at;
        Ok(alarm)
    }

    /// Replace an alarm's day set.
    pub fn set_days(&self, alarm_id: i64, days: &[Week]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(store_err)?;
        let tx = conn.transaction().map_err(store_err)?;
        tx.execute("DELETE FROM day_of_week WHERE alarm_id = ?1", [alarm_id])
            .map_err(store_err)?;
        for day in days {
            tx.execute(
                "INSERT OR IGNORE INTO day_of_week (alarm_id, day) VALUES (?1, ?2)",
                params![alarm_id, day.as_str()],
            )
            .map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;
        Ok(())
    }

    /// Delete an alarm (associations cascade).
    pub fn delete_alarm(&self, alarm_id: i64) -> Result<bool> {
        let conn = self.conn.lock().map_err(store_err)?;
        let n = conn
            .execute("DELETE FROM alarm WHERE id = ?1", [alarm_id])
            .map_err(store_err)?;
        Ok(n > 0)
    }

    // ─── Groups ──────────────────────────────────────

    /// Persisted group of an alarm.
    pub fn group_for_alarm(&self, alarm_id: i64) -> Result<Option<GroupRef>> {
        let conn = self.conn.lock().map_err(store_err)?;
        conn.query_row(
            "SELECT id, code, alarm_id FROM alarm_group WHERE alarm_id = ?1",
            [alarm_id],
            |row| {
                Ok(GroupRef {
                    id: row.get(0)?,
                    code: row.get(1)?,
                    alarm_id: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(store_err)
    }

    /// Number of persisted groups.
    pub fn group_count(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(store_err)?;
        conn.query_row("SELECT COUNT(*) FROM alarm_group", [], |r| r.get::<_, i64>(0))
            .map(|n| n as usize)
            .map_err(store_err)
    }

    fn insert_group(conn: &Connection, staged: &StagedGroup) -> Result<()> {
        conn.execute(
            "INSERT INTO alarm_group (id, alarm_id, code, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                staged.group.id,
                staged.group.alarm_id,
                staged.group.code,
                staged.created_at.to_rfc3339()
            ],
        )
        .map_err(|e| store_err(format!("Insert group: {e}")))?;
        Ok(())
    }
}

fn new_group_code() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(8)
        .collect::<String>()
        .to_uppercase()
}

fn parse_days(joined: Option<String>) -> Vec<Week> {
    let mut days: Vec<Week> = joined
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();
    days.sort();
    days
}

fn alarm_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alarm> {
    let time_str: String = row.get(2)?;
    let created_str: String = row.get(3)?;
    let days: Option<String> = row.get(4)?;
    Ok(Alarm {
        id: row.get(0)?,
        label: row.get(1)?,
        alarm_time: NaiveTime::parse_from_str(&time_str, "%H:%M:%S").unwrap_or_default(),
        days: parse_days(days),
        created_at: DateTime::parse_from_rfc3339(&created_str)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

const ALARM_COLUMNS: &str = "a.id, a.label, a.alarm_time, a.created_at, \
     (SELECT group_concat(d2.day) FROM day_of_week d2 WHERE d2.alarm_id = a.id)";

impl AlarmStore for SqliteAlarmStore {
    fn alarms_for_day(&self, day: Week, after_id: Option<i64>, limit: usize) -> Result<Vec<Alarm>> {
        let conn = self.conn.lock().map_err(unavailable)?;
        let sql = format!(
            "SELECT {ALARM_COLUMNS} FROM alarm a
             JOIN day_of_week d ON d.alarm_id = a.id
             WHERE d.day = ?1 AND a.id > ?2
             ORDER BY a.id
             LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
        let rows = stmt
            .query_map(
                params![day.as_str(), after_id.unwrap_or(i64::MIN), limit as i64],
                alarm_from_row,
            )
            .map_err(unavailable)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(unavailable)
    }

    fn associations(
        &self,
        after: Option<DayOfWeekAssociation>,
        limit: usize,
    ) -> Result<Vec<DayOfWeekAssociation>> {
        let conn = self.conn.lock().map_err(unavailable)?;
        let (after_id, after_day) = match after {
            Some(a) => (a.alarm_id, a.day.as_str()),
            None => (i64::MIN, ""),
        };
        let mut stmt = conn
            .prepare(
                "SELECT alarm_id, day FROM day_of_week
                 WHERE alarm_id > ?1 OR (alarm_id = ?1 AND day > ?2)
                 ORDER BY alarm_id, day
                 LIMIT ?3",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![after_id, after_day, limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(unavailable)?;

        let mut out = Vec::new();
        for row in rows {
            let (alarm_id, day) = row.map_err(unavailable)?;
            out.push(DayOfWeekAssociation {
                alarm_id,
                day: day.parse()?,
            });
        }
        Ok(out)
    }

    fn find_alarm(&self, id: i64) -> Result<Option<Alarm>> {
        let conn = self.conn.lock().map_err(unavailable)?;
        let sql = format!("SELECT {ALARM_COLUMNS} FROM alarm a WHERE a.id = ?1");
        conn.query_row(&sql, [id], alarm_from_row)
            .optional()
            .map_err(unavailable)
    }
}

#[async_trait]
impl GroupStore for SqliteAlarmStore {
    async fn resolve_or_create_group(&self, alarm: &Alarm) -> Result<GroupRef> {
        if let Some(group) = self.group_for_alarm(alarm.id)? {
            return Ok(group);
        }

        let conn = self.conn.lock().map_err(store_err)?;
        let mut staged = self.staged.lock().map_err(store_err)?;

        if let Some(existing) = staged
            .as_ref()
            .and_then(|s| s.iter().find(|g| g.group.alarm_id == alarm.id))
        {
            return Ok(existing.group.clone());
        }

        let max_id: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM alarm_group", [], |r| r.get(0))
            .map_err(store_err)?;
        let pending = staged.as_ref().map(|s| s.len() as i64).unwrap_or(0);
        let candidate = StagedGroup {
            group: GroupRef {
                id: max_id + pending + 1,
                code: new_group_code(),
                alarm_id: alarm.id,
            },
            created_at: Utc::now(),
        };

        match staged.as_mut() {
            Some(open) => open.push(candidate.clone()),
            // No chunk open: write through.
            None => Self::insert_group(&conn, &candidate)?,
        }
        tracing::debug!(alarm_id = alarm.id, group_id = candidate.group.id, "group created");
        Ok(candidate.group)
    }
}

impl ChunkTransaction for SqliteAlarmStore {
    fn begin(&self) -> Result<()> {
        let mut staged = self.staged.lock().map_err(store_err)?;
        if staged.is_some() {
            tracing::warn!("begin() with an open chunk; discarding its staged groups");
        }
        *staged = Some(Vec::new());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut conn = self.conn.lock().map_err(store_err)?;
        let mut staged = self.staged.lock().map_err(store_err)?;
        let groups = staged.take().unwrap_or_default();
        if groups.is_empty() {
            return Ok(());
        }
        let tx = conn.transaction().map_err(store_err)?;
        for group in &groups {
            Self::insert_group(&tx, group)?;
        }
        tx.commit().map_err(|e| store_err(format!("Commit groups: {e}")))?;
        Ok(())
    }

    fn rollback(&self) {
        match self.staged.lock() {
            Ok(mut staged) => {
                if let Some(dropped) = staged.take()
                    && !dropped.is_empty()
                {
                    tracing::debug!(groups = dropped.len(), "rolled back staged groups");
                }
            }
            Err(e) => tracing::warn!("rollback: staging lock poisoned: {e}"),
        }
    }
}
