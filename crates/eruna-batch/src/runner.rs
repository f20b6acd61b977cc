//! Job runner — one execution of the daily alarm job.
//!
//! ```text
//! run(params)
//!   ├── ledger: duplicate / in-progress / restart checks
//!   ├── CREATED → RUNNING (day and ring date resolved once)
//!   ├── chunk loop ── stop? ── take(chunk_size) ── begin
//!   │                  process each ── write chunk ── commit ── record_chunk
//!   └── RUNNING → COMPLETED | FAILED | STOPPED
//! ```
//!
//! A failed chunk is rolled back on its own; chunks committed before it stay
//! committed and the ledger cursor points just past them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use eruna_core::{Alarm, BatchConfig, ErunaError, Result, Week};

use crate::day::{DayClock, ring_date};
use crate::ledger::{BatchStatus, ChunkProgress, ExecutionLedger, ExecutionRecord};
use crate::params::{DAY_KEY, JobParameters, LAUNCH_DATE_KEY};
use crate::processor::{AlarmProcessor, Processed};
use crate::reader::{AlarmFeed, PagedAlarmSource};
use crate::store::ChunkTransaction;
use crate::writer::AlarmWriter;

/// Static settings of one job.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub job_name: String,
    pub chunk_size: usize,
    pub allow_start_if_complete: bool,
    pub clock: DayClock,
}

impl JobSettings {
    pub fn from_config(batch: &BatchConfig) -> Self {
        Self {
            job_name: batch.job_name.clone(),
            chunk_size: batch.chunk_size.max(1),
            allow_start_if_complete: batch.allow_start_if_complete,
            clock: DayClock::from_offset_minutes(batch.utc_offset_minutes),
        }
    }
}

/// Cooperative stop request, observed between chunks.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Rolls the chunk back unless it was committed.
struct ChunkTxGuard<'a> {
    tx: &'a dyn ChunkTransaction,
    committed: bool,
}

impl<'a> ChunkTxGuard<'a> {
    fn begin(tx: &'a dyn ChunkTransaction) -> Result<Self> {
        tx.begin()?;
        Ok(Self {
            tx,
            committed: false,
        })
    }

    fn commit(mut self) -> Result<()> {
        self.tx.commit()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for ChunkTxGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.tx.rollback();
        }
    }
}

/// Counters of a finished execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub execution_id: i64,
    pub status: BatchStatus,
    pub chunks: u64,
    pub pages: u64,
    pub read: u64,
    pub written: u64,
    pub skipped: u64,
}

impl From<&ExecutionRecord> for JobSummary {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.id,
            status: record.status,
            chunks: record.chunks_committed,
            pages: record.pages_read,
            read: record.read_count,
            written: record.write_count,
            skipped: record.skip_count,
        }
    }
}

impl std::fmt::Display for JobSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "execution {} {}: {} chunks, {} pages, {} read, {} written, {} skipped",
            self.execution_id, self.status, self.chunks, self.pages, self.read, self.written, self.skipped
        )
    }
}

struct StepOutcome {
    status: BatchStatus,
    message: Option<String>,
    failed_alarm_id: Option<i64>,
}

impl StepOutcome {
    fn completed() -> Self {
        Self {
            status: BatchStatus::Completed,
            message: None,
            failed_alarm_id: None,
        }
    }

    fn stopped() -> Self {
        Self {
            status: BatchStatus::Stopped,
            message: Some("stop requested".into()),
            failed_alarm_id: None,
        }
    }

    fn failed(err: &ErunaError) -> Self {
        Self {
            status: BatchStatus::Failed,
            message: Some(err.to_string()),
            failed_alarm_id: err.alarm_id(),
        }
    }
}

/// Runs the single read-process-write step of the job.
pub struct JobRunner {
    settings: JobSettings,
    source: PagedAlarmSource,
    processor: Arc<dyn AlarmProcessor>,
    writer: Arc<dyn AlarmWriter>,
    tx: Arc<dyn ChunkTransaction>,
    ledger: Arc<ExecutionLedger>,
    stop: StopHandle,
}

impl JobRunner {
    pub fn new(
        settings: JobSettings,
        source: PagedAlarmSource,
        processor: Arc<dyn AlarmProcessor>,
        writer: Arc<dyn AlarmWriter>,
        tx: Arc<dyn ChunkTransaction>,
        ledger: Arc<ExecutionLedger>,
    ) -> Self {
        Self {
            settings,
            source,
            processor,
            writer,
            tx,
            ledger,
            stop: StopHandle::default(),
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<ExecutionLedger> {
        &self.ledger
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the job once for `params`. Chunk and source failures end in a
    /// FAILED record; only launch refusals and ledger faults are errors.
    pub async fn run(&self, params: JobParameters) -> Result<ExecutionRecord> {
        let job = self.settings.job_name.as_str();
        let key = params.identity_key()?;
        let prior = self.ledger.last_for_instance(job, &key)?;

        let restart_of = match &prior {
            Some(p) if !p.status.is_terminal() => {
                return Err(ErunaError::RunInProgress {
                    job: job.to_string(),
                    execution_id: p.id,
                });
            }
            Some(p) if p.status == BatchStatus::Completed => {
                if !self.settings.allow_start_if_complete {
                    return Err(ErunaError::DuplicateRunRejected {
                        job: job.to_string(),
                        params: key,
                    });
                }
                None
            }
            Some(p) => Some(p),
            None => None,
        };

        let requested_day = params.get_string(DAY_KEY).map(str::parse::<Week>).transpose()?;

        let exec = self.ledger.create(job, &params, restart_of)?;
        let day = exec
            .day
            .or(requested_day)
            .unwrap_or_else(|| self.settings.clock.today());
        let exec = self.ledger.mark_running(exec.id, day)?;
        let resume_after = exec.last_committed_id;

        // Alarms ring on the first `day` on or after the launch date.
        let launched = params
            .get_date(LAUNCH_DATE_KEY)
            .or(restart_of.map(|r| r.created_at))
            .unwrap_or(exec.created_at);
        let ring_on = ring_date(day, self.settings.clock.date_at(launched));

        tracing::info!(
            job,
            execution_id = exec.id,
            %day,
            %ring_on,
            resume_after = ?resume_after,
            restarted_from = ?exec.restarted_from,
            "job started"
        );

        let outcome = self.execute_step(exec.id, day, ring_on, resume_after).await;
        let record = self.ledger.finish(
            exec.id,
            outcome.status,
            outcome.message.as_deref(),
            outcome.failed_alarm_id,
        )?;
        if record.status == BatchStatus::Stopped {
            self.stop.clear();
        }

        let summary = JobSummary::from(&record);
        match record.status {
            BatchStatus::Completed => tracing::info!(job, "{summary}"),
            _ => tracing::warn!(
                job,
                failed_alarm_id = ?record.failed_alarm_id,
                exit = record.exit_message.as_deref().unwrap_or(""),
                "{summary}"
            ),
        }
        Ok(record)
    }

    async fn execute_step(
        &self,
        execution_id: i64,
        day: Week,
        ring_on: NaiveDate,
        resume_after: Option<i64>,
    ) -> StepOutcome {
        let cursor = self.source.open(day, resume_after);
        let mut feed = AlarmFeed::new(self.source.clone(), cursor);
        let mut pages_seen = 0;
        let mut chunk_no = 0u64;

        loop {
            if self.stop.is_stop_requested() {
                tracing::info!(execution_id, chunks = chunk_no, "stop observed between chunks");
                return StepOutcome::stopped();
            }

            let items = match feed.take(self.settings.chunk_size) {
                Ok(items) => items,
                Err(e) => {
                    tracing::error!(execution_id, "read failed: {e}");
                    return StepOutcome::failed(&e);
                }
            };
            let Some(last_id) = items.last().map(|a| a.id) else {
                return StepOutcome::completed();
            };
            chunk_no += 1;

            match self.write_chunk(day, ring_on, items).await {
                Ok((read, written, skipped)) => {
                    let pages = feed.pages_read();
                    let progress = ChunkProgress {
                        pages_read: pages - pages_seen,
                        read,
                        written,
                        skipped,
                        last_committed_id: Some(last_id),
                    };
                    pages_seen = pages;
                    if let Err(e) = self.ledger.record_chunk(execution_id, &progress) {
                        tracing::error!(execution_id, chunk = chunk_no, "ledger update failed: {e}");
                        return StepOutcome::failed(&e);
                    }
                    tracing::info!(
                        execution_id,
                        chunk = chunk_no,
                        read,
                        written,
                        skipped,
                        last_alarm_id = last_id,
                        "chunk committed"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        execution_id,
                        chunk = chunk_no,
                        alarm_id = ?e.alarm_id(),
                        "chunk rolled back: {e}"
                    );
                    return StepOutcome::failed(&e);
                }
            }
        }
    }

    /// Process and write one chunk inside its transaction. Returns (read, written, skipped).
    async fn write_chunk(&self, day: Week, ring_on: NaiveDate, items: Vec<Alarm>) -> Result<(u64, u64, u64)> {
        let read = items.len() as u64;
        let guard = ChunkTxGuard::begin(self.tx.as_ref())?;

        let mut kept = Vec::with_capacity(items.len());
        for alarm in items {
            match self.processor.process(alarm, day)? {
                Processed::Keep(alarm) => kept.push(alarm),
                Processed::Skip => {}
            }
        }
        let written = kept.len() as u64;

        if !kept.is_empty() {
            self.writer.write(&kept, ring_on).await?;
        }
        guard.commit()?;
        Ok((read, written, read - written))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::AlarmDispatcher;
    use crate::params::RunIdentity;
    use crate::processor::{PassThrough, Revalidate};
    use crate::reader::ReadStrategy;
    use crate::store::{AlarmStore, SqliteAlarmStore};
    use crate::writer::GroupingAlarmWriter;
    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeZone, Utc};
    use eruna_core::{DayOfWeekAssociation, GroupRef};
    use std::sync::Mutex;

    /// Records dispatched alarm ids; can fail on one id or request a stop on one id.
    #[derive(Default)]
    struct Probe {
        seen: Mutex<Vec<i64>>,
        dates: Mutex<Vec<NaiveDate>>,
        fail_on: Mutex<Option<i64>>,
        stop_on: Mutex<Option<(i64, StopHandle)>>,
    }

    #[async_trait]
    impl AlarmDispatcher for Probe {
        async fn dispatch(&self, alarm: &Alarm, _group: &GroupRef, date: NaiveDate) -> Result<()> {
            if *self.fail_on.lock().unwrap() == Some(alarm.id) {
                return Err(ErunaError::Dispatch("refused".into()));
            }
            if let Some((id, handle)) = self.stop_on.lock().unwrap().as_ref()
                && *id == alarm.id
            {
                handle.request_stop();
            }
            self.seen.lock().unwrap().push(alarm.id);
            self.dates.lock().unwrap().push(date);
            Ok(())
        }

        fn name(&self) -> &str {
            "probe"
        }
    }

    struct Fixture {
        store: Arc<SqliteAlarmStore>,
        probe: Arc<Probe>,
        ledger: Arc<ExecutionLedger>,
    }

    /// `n` alarms ringing on Monday, ids 1..=n.
    fn fixture(n: usize) -> Fixture {
        let store = SqliteAlarmStore::open_in_memory().unwrap();
        let t = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        for i in 0..n {
            store.insert_alarm(&format!("a{i}"), t, &[Week::Mon]).unwrap();
        }
        Fixture {
            store: Arc::new(store),
            probe: Arc::new(Probe::default()),
            ledger: Arc::new(ExecutionLedger::open_in_memory().unwrap()),
        }
    }

    fn settings(allow_start_if_complete: bool) -> JobSettings {
        JobSettings {
            job_name: "readAlarmsJob".into(),
            chunk_size: 100,
            allow_start_if_complete,
            clock: DayClock::Offset(0),
        }
    }

    fn runner(fx: &Fixture, settings: JobSettings, processor: Arc<dyn AlarmProcessor>) -> JobRunner {
        let source = PagedAlarmSource::new(fx.store.clone(), ReadStrategy::Paged, 10);
        let writer = Arc::new(GroupingAlarmWriter::new(fx.store.clone(), fx.probe.clone()));
        JobRunner::new(settings, source, processor, writer, fx.store.clone(), fx.ledger.clone())
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    /// Launched on Monday 2026-10-19 and pinned to MON, so runs do not depend on the wall clock.
    fn params(run_id: i64) -> JobParameters {
        RunIdentity {
            run_id,
            launch_date: Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap(),
        }
        .to_parameters()
        .with_string(DAY_KEY, "MON")
    }

    #[tokio::test]
    async fn test_chunk_count_is_ceiling_of_items() {
        let fx = fixture(250);
        let r = runner(&fx, settings(true), Arc::new(PassThrough));
        let p = params(1);

        let record = r.run(p).await.unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.chunks_committed, 3);
        assert_eq!(record.read_count, 250);
        assert_eq!(record.write_count, 250);
        assert_eq!(record.pages_read, 25);
        assert_eq!(record.last_committed_id, Some(250));
        assert_eq!(fx.store.group_count().unwrap(), 250);
        assert_eq!(*fx.probe.seen.lock().unwrap(), (1..=250).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_failed_chunk_rolls_back_alone_and_restart_resumes() {
        let fx = fixture(250);
        *fx.probe.fail_on.lock().unwrap() = Some(150);
        let r = runner(&fx, settings(true), Arc::new(PassThrough));
        let p = params(1);

        let failed = r.run(p.clone()).await.unwrap();
        assert_eq!(failed.status, BatchStatus::Failed);
        assert_eq!(failed.chunks_committed, 1);
        assert_eq!(failed.failed_alarm_id, Some(150));
        assert_eq!(failed.last_committed_id, Some(100));
        // Chunk 1 persisted, chunk 2 rolled back.
        assert_eq!(fx.store.group_count().unwrap(), 100);
        assert!(fx.store.group_for_alarm(120).unwrap().is_none());

        *fx.probe.fail_on.lock().unwrap() = None;
        fx.probe.seen.lock().unwrap().clear();

        let resumed = r.run(p).await.unwrap();
        assert_eq!(resumed.status, BatchStatus::Completed);
        assert_eq!(resumed.restarted_from, Some(failed.id));
        assert_eq!(resumed.chunks_committed, 2);
        assert_eq!(fx.probe.seen.lock().unwrap().first(), Some(&101));
        assert_eq!(fx.store.group_count().unwrap(), 250);
        // The resumed run still plans Monday's rings.
        assert!(fx.probe.dates.lock().unwrap().iter().all(|d| *d == monday()));
    }

    #[tokio::test]
    async fn test_ring_date_follows_run_day_not_launch_day() {
        let fx = fixture(0);
        let t = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let tue = fx.store.insert_alarm("tue", t, &[Week::Tue]).unwrap();
        let r = runner(&fx, settings(true), Arc::new(PassThrough));

        let record = r.run(params(1).with_string(DAY_KEY, "TUE")).await.unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.day, Some(Week::Tue));
        assert_eq!(*fx.probe.seen.lock().unwrap(), vec![tue.id]);
        assert_eq!(
            *fx.probe.dates.lock().unwrap(),
            vec![NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_abandoned_crash_resumes_from_cursor() {
        let fx = fixture(250);
        let p = params(1);

        // A process that committed one chunk and died before finishing.
        let crashed = fx.ledger.create("readAlarmsJob", &p, None).unwrap();
        fx.ledger.mark_running(crashed.id, Week::Mon).unwrap();
        fx.ledger
            .record_chunk(
                crashed.id,
                &ChunkProgress {
                    pages_read: 10,
                    read: 100,
                    written: 100,
                    skipped: 0,
                    last_committed_id: Some(100),
                },
            )
            .unwrap();

        let r = runner(&fx, settings(true), Arc::new(PassThrough));
        assert!(matches!(
            r.run(p.clone()).await.unwrap_err(),
            ErunaError::RunInProgress { .. }
        ));

        fx.ledger.abandon(crashed.id, "process died").unwrap();
        let resumed = r.run(p).await.unwrap();
        assert_eq!(resumed.status, BatchStatus::Completed);
        assert_eq!(resumed.restarted_from, Some(crashed.id));
        assert_eq!(resumed.read_count, 150);
        assert_eq!(fx.probe.seen.lock().unwrap().first(), Some(&101));
        assert_eq!(fx.probe.seen.lock().unwrap().len(), 150);
    }

    #[tokio::test]
    async fn test_completed_instance_policy() {
        let fx = fixture(5);
        let p = params(1);

        let strict = runner(&fx, settings(false), Arc::new(PassThrough));
        let done = strict.run(p.clone()).await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);

        let err = strict.run(p.clone()).await.unwrap_err();
        assert!(matches!(err, ErunaError::DuplicateRunRejected { .. }));

        let lenient = runner(&fx, settings(true), Arc::new(PassThrough));
        let again = lenient.run(p).await.unwrap();
        assert_eq!(again.status, BatchStatus::Completed);
        assert_ne!(again.id, done.id);
        assert_eq!(again.restarted_from, None);
    }

    #[tokio::test]
    async fn test_open_instance_is_rejected() {
        let fx = fixture(1);
        let p = params(9);
        let open = fx.ledger.create("readAlarmsJob", &p, None).unwrap();

        let r = runner(&fx, settings(true), Arc::new(PassThrough));
        match r.run(p).await.unwrap_err() {
            ErunaError::RunInProgress { execution_id, .. } => assert_eq!(execution_id, open.id),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_stop_is_observed_between_chunks() {
        let fx = fixture(250);
        let r = runner(&fx, settings(true), Arc::new(PassThrough));
        *fx.probe.stop_on.lock().unwrap() = Some((50, r.stop_handle()));
        let p = params(1);

        let stopped = r.run(p.clone()).await.unwrap();
        assert_eq!(stopped.status, BatchStatus::Stopped);
        assert_eq!(stopped.chunks_committed, 1);
        assert_eq!(stopped.last_committed_id, Some(100));
        assert!(!r.stop_handle().is_stop_requested());

        *fx.probe.stop_on.lock().unwrap() = None;
        let resumed = r.run(p).await.unwrap();
        assert_eq!(resumed.status, BatchStatus::Completed);
        assert_eq!(resumed.read_count, 150);
    }

    struct SkipEven;

    impl AlarmProcessor for SkipEven {
        fn process(&self, alarm: Alarm, _day: Week) -> Result<Processed> {
            if alarm.id % 2 == 0 {
                Ok(Processed::Skip)
            } else {
                Ok(Processed::Keep(alarm))
            }
        }

        fn name(&self) -> &str {
            "skip_even"
        }
    }

    #[tokio::test]
    async fn test_skips_are_counted_not_written() {
        let fx = fixture(10);
        let r = runner(&fx, settings(true), Arc::new(SkipEven));
        let p = params(1);

        let record = r.run(p).await.unwrap();
        assert_eq!(record.read_count, 10);
        assert_eq!(record.write_count, 5);
        assert_eq!(record.skip_count, 5);
        assert_eq!(*fx.probe.seen.lock().unwrap(), vec![1, 3, 5, 7, 9]);
        // Cursor covers skipped alarms too.
        assert_eq!(record.last_committed_id, Some(10));
    }

    #[tokio::test]
    async fn test_processor_error_fails_chunk() {
        let fx = fixture(3);
        let r = runner(&fx, settings(true), Arc::new(Revalidate::new(Arc::new(DownStore))));
        let p = params(1);

        let record = r.run(p).await.unwrap();
        assert_eq!(record.status, BatchStatus::Failed);
        assert_eq!(record.failed_alarm_id, Some(1));
        assert_eq!(fx.store.group_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_day_completes_with_no_chunks() {
        let fx = fixture(0);
        let r = runner(&fx, settings(true), Arc::new(PassThrough));
        let record = r.run(params(1)).await.unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
        assert_eq!(record.chunks_committed, 0);
        assert_eq!(fx.probe.seen.lock().unwrap().len(), 0);
    }

    struct DownStore;

    impl AlarmStore for DownStore {
        fn alarms_for_day(&self, _: Week, _: Option<i64>, _: usize) -> Result<Vec<Alarm>> {
            Err(ErunaError::SourceUnavailable("connection refused".into()))
        }

        fn associations(
            &self,
            _: Option<DayOfWeekAssociation>,
            _: usize,
        ) -> Result<Vec<DayOfWeekAssociation>> {
            Err(ErunaError::SourceUnavailable("connection refused".into()))
        }

        fn find_alarm(&self, _: i64) -> Result<Option<Alarm>> {
            Err(ErunaError::SourceUnavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_unavailable_source_fails_run() {
        let fx = fixture(0);
        let source = PagedAlarmSource::new(Arc::new(DownStore), ReadStrategy::Paged, 10);
        let writer = Arc::new(GroupingAlarmWriter::new(fx.store.clone(), fx.probe.clone()));
        let r = JobRunner::new(
            settings(true),
            source,
            Arc::new(PassThrough),
            writer,
            fx.store.clone(),
            fx.ledger.clone(),
        );

        let record = r.run(params(1)).await.unwrap();
        assert_eq!(record.status, BatchStatus::Failed);
        assert!(record.exit_message.unwrap().contains("unavailable"));
    }
}
