//! SQLite-backed execution ledger: one row per job execution.
//! Survives restarts, so a failed or stopped run can resume from its cursor.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use eruna_core::{ErunaError, Result, Week};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::params::{JobParameters, RUN_ID_KEY};

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    Created,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Created => "CREATED",
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Stopped
        )
    }

    /// Terminal states a later run of the same instance may resume from.
    pub fn is_restartable(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Stopped)
    }

    pub fn can_transition(&self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Created, Running) | (Created, Failed) | (Created, Stopped)
                | (Running, Completed) | (Running, Failed) | (Running, Stopped)
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ErunaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(BatchStatus::Created),
            "RUNNING" => Ok(BatchStatus::Running),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            "STOPPED" => Ok(BatchStatus::Stopped),
            other => Err(ErunaError::Ledger(format!("unknown batch status '{other}'"))),
        }
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub job_name: String,
    /// Canonical identity of the parameters.
    pub params_key: String,
    pub parameters: JobParameters,
    pub run_id: Option<i64>,
    pub status: BatchStatus,
    /// Day the execution read alarms for.
    pub day: Option<Week>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub chunks_committed: u64,
    pub pages_read: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    /// Id of the last alarm of the last committed chunk.
    pub last_committed_id: Option<i64>,
    pub failed_alarm_id: Option<i64>,
    pub exit_message: Option<String>,
    /// Execution this one resumed from.
    pub restarted_from: Option<i64>,
}

/// Counter deltas of one committed chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    pub pages_read: u64,
    pub read: u64,
    pub written: u64,
    pub skipped: u64,
    pub last_committed_id: Option<i64>,
}

/// Persistence for executions.
pub struct ExecutionLedger {
    conn: Mutex<Connection>,
}

fn ledger_err(e: impl std::fmt::Display) -> ErunaError {
    ErunaError::Ledger(e.to_string())
}

fn parse_time(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

const COLUMNS: &str = "id, job_name, params_key, params_json, run_id, status, day, created_at, \
    started_at, ended_at, chunks_committed, pages_read, read_count, write_count, skip_count, \
    last_committed_id, failed_alarm_id, exit_message, restarted_from";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let params_json: String = row.get(3)?;
    let status: String = row.get(5)?;
    let day: Option<String> = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(ExecutionRecord {
        id: row.get(0)?,
        job_name: row.get(1)?,
        params_key: row.get(2)?,
        parameters: serde_json::from_str(&params_json).unwrap_or_default(),
        run_id: row.get(4)?,
        status: status.parse().unwrap_or(BatchStatus::Failed),
        day: day.and_then(|d| d.parse().ok()),
        created_at: parse_time(Some(created_at)).unwrap_or_else(Utc::now),
        started_at: parse_time(row.get(8)?),
        ended_at: parse_time(row.get(9)?),
        chunks_committed: row.get::<_, i64>(10)? as u64,
        pages_read: row.get::<_, i64>(11)? as u64,
        read_count: row.get::<_, i64>(12)? as u64,
        write_count: row.get::<_, i64>(13)? as u64,
        skip_count: row.get::<_, i64>(14)? as u64,
        last_committed_id: row.get(15)?,
        failed_alarm_id: row.get(16)?,
        exit_message: row.get(17)?,
        restarted_from: row.get(18)?,
    })
}

impl ExecutionLedger {
    /// Open or create the ledger database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| ledger_err(format!("DB open: {e}")))?;
        conn.busy_timeout(std::time::Duration::from_secs(5)).ok();
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(ledger_err)?;
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(ledger_err)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS job_execution (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_name TEXT NOT NULL,
                params_key TEXT NOT NULL,
                params_json TEXT NOT NULL,
                run_id INTEGER,
                status TEXT NOT NULL,
                day TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                chunks_committed INTEGER NOT NULL DEFAULT 0,
                pages_read INTEGER NOT NULL DEFAULT 0,
                read_count INTEGER NOT NULL DEFAULT 0,
                write_count INTEGER NOT NULL DEFAULT 0,
                skip_count INTEGER NOT NULL DEFAULT 0,
                last_committed_id INTEGER,
                failed_alarm_id INTEGER,
                exit_message TEXT,
                restarted_from INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_job_execution_instance
                ON job_execution(job_name, params_key);
            ",
        )
        .map_err(|e| ledger_err(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Insert a CREATED execution. A restart inherits the prior cursor and day.
    pub fn create(
        &self,
        job_name: &str,
        parameters: &JobParameters,
        restart_of: Option<&ExecutionRecord>,
    ) -> Result<ExecutionRecord> {
        let params_key = parameters.identity_key()?;
        let params_json = serde_json::to_string(parameters)?;
        let id = {
            let conn = self.conn.lock().map_err(ledger_err)?;
            conn.execute(
                "INSERT INTO job_execution
                 (job_name, params_key, params_json, run_id, status, day, created_at,
                  last_committed_id, restarted_from)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job_name,
                    params_key,
                    params_json,
                    parameters.get_long(RUN_ID_KEY),
                    BatchStatus::Created.as_str(),
                    restart_of.and_then(|r| r.day).map(|d| d.as_str()),
                    Utc::now().to_rfc3339(),
                    restart_of.and_then(|r| r.last_committed_id),
                    restart_of.map(|r| r.id),
                ],
            )
            .map_err(|e| ledger_err(format!("Create execution: {e}")))?;
            conn.last_insert_rowid()
        };
        self.require(id)
    }

    /// CREATED → RUNNING, recording the day being processed.
    pub fn mark_running(&self, id: i64, day: Week) -> Result<ExecutionRecord> {
        self.guard(id, BatchStatus::Running)?;
        {
            let conn = self.conn.lock().map_err(ledger_err)?;
            conn.execute(
                "UPDATE job_execution SET status = ?2, day = ?3, started_at = ?4 WHERE id = ?1",
                params![
                    id,
                    BatchStatus::Running.as_str(),
                    day.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(ledger_err)?;
        }
        self.require(id)
    }

    /// Add one committed chunk's counters and advance the restart cursor.
    pub fn record_chunk(&self, id: i64, progress: &ChunkProgress) -> Result<()> {
        let conn = self.conn.lock().map_err(ledger_err)?;
        let n = conn
            .execute(
                "UPDATE job_execution SET
                    chunks_committed = chunks_committed + 1,
                    pages_read = pages_read + ?2,
                    read_count = read_count + ?3,
                    write_count = write_count + ?4,
                    skip_count = skip_count + ?5,
                    last_committed_id = COALESCE(?6, last_committed_id)
                 WHERE id = ?1 AND status = ?7",
                params![
                    id,
                    progress.pages_read as i64,
                    progress.read as i64,
                    progress.written as i64,
                    progress.skipped as i64,
                    progress.last_committed_id,
                    BatchStatus::Running.as_str(),
                ],
            )
            .map_err(|e| ledger_err(format!("Record chunk: {e}")))?;
        if n == 0 {
            return Err(ErunaError::Ledger(format!(
                "execution {id} is not running; chunk not recorded"
            )));
        }
        Ok(())
    }

    /// Move to a terminal status.
    pub fn finish(
        &self,
        id: i64,
        status: BatchStatus,
        exit_message: Option<&str>,
        failed_alarm_id: Option<i64>,
    ) -> Result<ExecutionRecord> {
        if !status.is_terminal() {
            return Err(ErunaError::Ledger(format!("{status} is not a terminal status")));
        }
        self.guard(id, status)?;
        {
            let conn = self.conn.lock().map_err(ledger_err)?;
            conn.execute(
                "UPDATE job_execution SET status = ?2, ended_at = ?3, exit_message = ?4,
                    failed_alarm_id = ?5 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    exit_message,
                    failed_alarm_id
                ],
            )
            .map_err(|e| ledger_err(format!("Finish execution: {e}")))?;
        }
        self.require(id)
    }

    /// Mark an execution left CREATED or RUNNING by a dead process as FAILED,
    /// keeping its cursor so the next run of the instance resumes from it.
    pub fn abandon(&self, id: i64, reason: &str) -> Result<ExecutionRecord> {
        let current = self.require(id)?;
        if current.status.is_terminal() {
            return Err(ErunaError::Ledger(format!(
                "execution {id} already ended {}",
                current.status
            )));
        }
        tracing::warn!(
            execution_id = id,
            job = %current.job_name,
            last_committed_id = ?current.last_committed_id,
            "abandoning {} execution: {reason}",
            current.status
        );
        self.finish(id, BatchStatus::Failed, Some(reason), None)
    }

    /// Latest execution of a job instance.
    pub fn last_for_instance(&self, job_name: &str, params_key: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.lock().map_err(ledger_err)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM job_execution WHERE job_name = ?1 AND params_key = ?2
             ORDER BY id DESC LIMIT 1"
        );
        conn.query_row(&sql, params![job_name, params_key], record_from_row)
            .optional()
            .map_err(ledger_err)
    }

    pub fn get(&self, id: i64) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn.lock().map_err(ledger_err)?;
        let sql = format!("SELECT {COLUMNS} FROM job_execution WHERE id = ?1");
        conn.query_row(&sql, [id], record_from_row)
            .optional()
            .map_err(ledger_err)
    }

    /// Most recent executions of a job, newest first.
    pub fn recent(&self, job_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock().map_err(ledger_err)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM job_execution WHERE job_name = ?1 ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql).map_err(ledger_err)?;
        let rows = stmt
            .query_map(params![job_name, limit as i64], record_from_row)
            .map_err(ledger_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(ledger_err)
    }

    pub fn max_run_id(&self, job_name: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().map_err(ledger_err)?;
        conn.query_row(
            "SELECT MAX(run_id) FROM job_execution WHERE job_name = ?1",
            [job_name],
            |row| row.get(0),
        )
        .map_err(ledger_err)
    }

    fn require(&self, id: i64) -> Result<ExecutionRecord> {
        self.get(id)?
            .ok_or_else(|| ErunaError::Ledger(format!("execution {id} not found")))
    }

    fn guard(&self, id: i64, to: BatchStatus) -> Result<()> {
        let current = self.require(id)?.status;
        if current.can_transition(to) {
            Ok(())
        } else {
            Err(ErunaError::Ledger(format!(
                "execution {id}: illegal transition {current} -> {to}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RunIdentity;

    fn params(run_id: i64) -> JobParameters {
        RunIdentity {
            run_id,
            launch_date: Utc::now(),
        }
        .to_parameters()
    }

    #[test]
    fn test_lifecycle_and_counters() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        let exec = ledger.create("job", &params(1), None).unwrap();
        assert_eq!(exec.status, BatchStatus::Created);
        assert_eq!(exec.run_id, Some(1));

        let exec = ledger.mark_running(exec.id, Week::Mon).unwrap();
        assert_eq!(exec.day, Some(Week::Mon));
        assert!(exec.started_at.is_some());

        for last in [10, 20] {
            ledger
                .record_chunk(
                    exec.id,
                    &ChunkProgress {
                        pages_read: 1,
                        read: 10,
                        written: 9,
                        skipped: 1,
                        last_committed_id: Some(last),
                    },
                )
                .unwrap();
        }

        let done = ledger.finish(exec.id, BatchStatus::Completed, None, None).unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.chunks_committed, 2);
        assert_eq!(done.read_count, 20);
        assert_eq!(done.write_count, 18);
        assert_eq!(done.skip_count, 2);
        assert_eq!(done.last_committed_id, Some(20));
        assert!(done.ended_at.is_some());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        let exec = ledger.create("job", &params(1), None).unwrap();
        assert!(ledger.finish(exec.id, BatchStatus::Completed, None, None).is_err());
        assert!(ledger.finish(exec.id, BatchStatus::Running, None, None).is_err());

        ledger.mark_running(exec.id, Week::Tue).unwrap();
        ledger
            .finish(exec.id, BatchStatus::Failed, Some("boom"), Some(7))
            .unwrap();
        assert!(ledger.mark_running(exec.id, Week::Tue).is_err());
        assert!(ledger.record_chunk(exec.id, &ChunkProgress::default()).is_err());

        let failed = ledger.get(exec.id).unwrap().unwrap();
        assert_eq!(failed.failed_alarm_id, Some(7));
        assert_eq!(failed.exit_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_restart_inherits_cursor_and_day() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        let p = params(3);
        let first = ledger.create("job", &p, None).unwrap();
        ledger.mark_running(first.id, Week::Wed).unwrap();
        ledger
            .record_chunk(
                first.id,
                &ChunkProgress {
                    last_committed_id: Some(42),
                    ..Default::default()
                },
            )
            .unwrap();
        let failed = ledger.finish(first.id, BatchStatus::Failed, None, None).unwrap();

        let second = ledger.create("job", &p, Some(&failed)).unwrap();
        assert_eq!(second.restarted_from, Some(first.id));
        assert_eq!(second.last_committed_id, Some(42));
        assert_eq!(second.day, Some(Week::Wed));

        let last = ledger
            .last_for_instance("job", &p.identity_key().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(last.id, second.id);
    }

    #[test]
    fn test_abandon_fails_open_execution_only() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        let exec = ledger.create("job", &params(1), None).unwrap();
        ledger.mark_running(exec.id, Week::Mon).unwrap();
        ledger
            .record_chunk(
                exec.id,
                &ChunkProgress {
                    last_committed_id: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();

        let abandoned = ledger.abandon(exec.id, "process died").unwrap();
        assert_eq!(abandoned.status, BatchStatus::Failed);
        assert_eq!(abandoned.last_committed_id, Some(2));
        assert_eq!(abandoned.exit_message.as_deref(), Some("process died"));

        assert!(ledger.abandon(exec.id, "again").is_err());
        assert!(ledger.abandon(999, "missing").is_err());

        let created = ledger.create("job", &params(2), None).unwrap();
        assert_eq!(
            ledger.abandon(created.id, "never started").unwrap().status,
            BatchStatus::Failed
        );
    }

    #[test]
    fn test_recent_and_max_run_id() {
        let ledger = ExecutionLedger::open_in_memory().unwrap();
        assert_eq!(ledger.max_run_id("job").unwrap(), None);
        for run in 1..=3 {
            ledger.create("job", &params(run), None).unwrap();
        }
        ledger.create("job", &JobParameters::new().with_string("k", "v"), None).unwrap();

        assert_eq!(ledger.max_run_id("job").unwrap(), Some(3));
        let recent = ledger.recent("job", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].id > recent[1].id);
        assert_eq!(recent[0].run_id, None);
    }

    #[test]
    fn test_status_tokens() {
        for status in [
            BatchStatus::Created,
            BatchStatus::Running,
            BatchStatus::Completed,
            BatchStatus::Failed,
            BatchStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert!(BatchStatus::Stopped.is_restartable());
        assert!(!BatchStatus::Completed.is_restartable());
        assert!(!BatchStatus::Running.is_terminal());
    }
}
