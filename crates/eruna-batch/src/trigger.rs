//! Cron trigger — the loop that launches the daily run.
//! Sleeps in bounded steps between fire times, so a shutdown is seen promptly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use eruna_core::{ErunaError, Result, Week};
use tokio::sync::Notify;

use crate::cron::CronSchedule;
use crate::day::DayClock;
use crate::ledger::ExecutionRecord;
use crate::params::{DAY_KEY, RunIdIncrementer};
use crate::runner::{JobRunner, JobSummary};
use crate::schedule::PendingWork;

/// Fires the job on its cron schedule with a fresh run identity each time.
pub struct CronTrigger {
    schedule: CronSchedule,
    clock: DayClock,
    runner: Arc<JobRunner>,
    incrementer: RunIdIncrementer,
    pending: Arc<dyn PendingWork>,
    check_interval: Duration,
}

impl CronTrigger {
    /// Fails on an unparsable expression or one that never fires.
    pub fn new(
        cron: &str,
        runner: Arc<JobRunner>,
        pending: Arc<dyn PendingWork>,
        check_interval: Duration,
    ) -> Result<Self> {
        let schedule = CronSchedule::parse(cron)?;
        let clock = runner.settings().clock;
        let trigger = Self {
            schedule,
            clock,
            incrementer: RunIdIncrementer::new(runner.ledger().clone()),
            runner,
            pending,
            check_interval: check_interval.max(Duration::from_secs(1)),
        };
        if trigger.next_fire(Utc::now()).is_none() {
            return Err(ErunaError::Cron(format!("'{cron}' never fires")));
        }
        Ok(trigger)
    }

    pub fn schedule(&self) -> &CronSchedule {
        &self.schedule
    }

    /// Next fire time after `after`, evaluated in the job's clock.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.clock {
            DayClock::Local => self
                .schedule
                .next_after(&after.with_timezone(&Local))
                .map(|t| t.with_timezone(&Utc)),
            DayClock::Offset(minutes) => match FixedOffset::east_opt(minutes.saturating_mul(60)) {
                Some(tz) => self
                    .schedule
                    .next_after(&after.with_timezone(&tz))
                    .map(|t| t.with_timezone(&Utc)),
                None => self.schedule.next_after(&after),
            },
        }
    }

    /// One firing: clear this job's pending work, mint a new identity, run.
    pub async fn fire(&self, now: DateTime<Utc>) -> Result<ExecutionRecord> {
        self.fire_for(now, None).await
    }

    /// Like [`fire`](Self::fire), reading the alarms of `day` instead of today.
    pub async fn fire_for(&self, now: DateTime<Utc>, day: Option<Week>) -> Result<ExecutionRecord> {
        let job = self.runner.settings().job_name.as_str();
        let cleared = self.pending.clear_scope(job)?;
        let identity = self.incrementer.next(job, now)?;
        tracing::info!(job, run_id = identity.run_id, cleared, "trigger fired");

        let mut params = identity.to_parameters();
        if let Some(day) = day {
            params = params.with_string(DAY_KEY, day.as_str());
        }
        let record = self.runner.run(params).await?;
        tracing::info!(job, run_id = identity.run_id, "{}", JobSummary::from(&record));
        Ok(record)
    }

    /// Fire on schedule until `shutdown` is notified.
    pub async fn run_forever(&self, shutdown: Arc<Notify>) -> Result<()> {
        let notified = shutdown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let job = self.runner.settings().job_name.clone();
        let mut next = self.require_next(Utc::now())?;
        tracing::info!(
            job = %job,
            cron = self.schedule.expression(),
            next_fire = %next,
            "⏰ trigger started"
        );

        loop {
            let now = Utc::now();
            if now >= next {
                match self.fire(now).await {
                    Ok(record) => tracing::debug!(job = %job, execution_id = record.id, "run finished"),
                    Err(e) => tracing::error!(job = %job, "scheduled run not started: {e}"),
                }
                next = self.require_next(Utc::now())?;
                tracing::info!(job = %job, next_fire = %next, "next fire scheduled");
                continue;
            }

            let wait = (next - now)
                .to_std()
                .unwrap_or_default()
                .min(self.check_interval);
            tokio::select! {
                _ = &mut notified => {
                    tracing::info!(job = %job, "trigger stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn require_next(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.next_fire(after).ok_or_else(|| {
            ErunaError::Cron(format!("'{}' has no further fire time", self.schedule.expression()))
        })
    }
}
