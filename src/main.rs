//! # Eruna — daily alarm batch
//!
//! Usage:
//!   eruna daemon                               # Fire on the configured cron until Ctrl-C
//!   eruna run-now [--day MON]                  # Fire once, right now
//!   eruna restart 12                           # Resume a failed or stopped execution
//!   eruna restart 12 --abandon-stale           # Resume one left RUNNING by a dead process
//!   eruna executions --limit 20                # Recent executions from the ledger
//!   eruna today                                # Today's day-of-week token
//!   eruna seed-alarm --time 07:30 --days MON,WED

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveTime, Utc};
use clap::{Parser, Subcommand};
use eruna_batch::{
    BatchStatus, CronTrigger, DayClock, ExecutionLedger, ExecutionRecord, FireSchedule,
    GroupingAlarmWriter, JobRunner, JobSettings, JobSummary, PagedAlarmSource, SqliteAlarmStore,
    StopHandle, dispatcher_from_config, processor_for,
};
use eruna_core::{ErunaConfig, Week};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eruna", version, about = "⏰ Eruna — daily alarm batch")]
struct Cli {
    /// Config file (default: ~/.eruna/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cron trigger until interrupted
    Daemon,
    /// Fire the job once immediately with a new run identity
    RunNow {
        /// Read the alarms of this day (MON..SUN) instead of today
        #[arg(long)]
        day: Option<String>,
    },
    /// Re-run an execution's parameters; resumes from its cursor if it failed or stopped
    Restart {
        execution_id: i64,
        /// Start again even if that instance already completed
        #[arg(long)]
        allow_restart: bool,
        /// Mark the execution FAILED first if a dead process left it CREATED or RUNNING
        #[arg(long)]
        abandon_stale: bool,
    },
    /// List recent executions
    Executions {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Print today's day-of-week token
    Today,
    /// Insert an alarm into the store
    SeedAlarm {
        #[arg(long, default_value = "alarm")]
        label: String,
        /// HH:MM or HH:MM:SS
        #[arg(long)]
        time: String,
        /// Comma-separated tokens, e.g. MON,WED,FRI
        #[arg(long, default_value = "")]
        days: String,
    },
}

/// Everything one process needs, opened against the configured database.
struct App {
    config: ErunaConfig,
    store: Arc<SqliteAlarmStore>,
    ledger: Arc<ExecutionLedger>,
    fires: Arc<FireSchedule>,
}

impl App {
    fn open(config: ErunaConfig) -> Result<Self> {
        let db_path = config.database.resolved_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Arc::new(SqliteAlarmStore::open(&db_path)?);
        let ledger = Arc::new(ExecutionLedger::open(&db_path)?);
        let fires = Arc::new(FireSchedule::open(&db_path)?);
        Ok(Self {
            config,
            store,
            ledger,
            fires,
        })
    }

    fn runner(&self, allow_restart_override: bool) -> Arc<JobRunner> {
        let batch = &self.config.batch;
        let mut settings = JobSettings::from_config(batch);
        settings.allow_start_if_complete |= allow_restart_override;

        let dispatcher = Arc::new(dispatcher_from_config(
            &self.config.dispatch,
            self.fires.clone(),
            &batch.job_name,
        ));
        let source = PagedAlarmSource::new(self.store.clone(), batch.reader.into(), batch.page_size);
        let processor = processor_for(batch.processor, self.store.clone());
        let writer = Arc::new(GroupingAlarmWriter::new(self.store.clone(), dispatcher));

        Arc::new(JobRunner::new(
            settings,
            source,
            processor,
            writer,
            self.store.clone(),
            self.ledger.clone(),
        ))
    }

    fn trigger(&self, runner: Arc<JobRunner>) -> Result<CronTrigger> {
        Ok(CronTrigger::new(
            &self.config.batch.cron,
            runner,
            self.fires.clone(),
            Duration::from_secs(self.config.batch.check_interval_secs),
        )?)
    }
}

/// Ctrl-C requests a stop between chunks and wakes the trigger loop.
fn watch_ctrl_c(stop: StopHandle, shutdown: Arc<Notify>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 interrupt received, stopping after the current chunk");
            stop.request_stop();
            shutdown.notify_one();
        }
    })
}

fn finish(record: &ExecutionRecord) -> Result<()> {
    println!("{}", JobSummary::from(record));
    match record.status {
        BatchStatus::Completed => Ok(()),
        status => anyhow::bail!(
            "execution {} ended {status}: {}",
            record.id,
            record.exit_message.as_deref().unwrap_or("")
        ),
    }
}

fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .with_context(|| format!("invalid time '{s}' (expected HH:MM)"))
}

fn parse_days(s: &str) -> Result<Vec<Week>> {
    s.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<Week>().map_err(anyhow::Error::from))
        .collect()
}

fn print_executions(records: &[ExecutionRecord]) {
    if records.is_empty() {
        println!("No executions yet.");
        return;
    }
    println!(
        "{:>5}  {:>6}  {:<9}  {:<3}  {:>6}  {:>6}  {:>6}  {:>6}  {:<25}",
        "ID", "RUN", "STATUS", "DAY", "CHUNKS", "READ", "WROTE", "CURSOR", "STARTED"
    );
    for r in records {
        println!(
            "{:>5}  {:>6}  {:<9}  {:<3}  {:>6}  {:>6}  {:>6}  {:>6}  {:<25}",
            r.id,
            r.run_id.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            r.status.as_str(),
            r.day.map(|d| d.as_str()).unwrap_or("-"),
            r.chunks_committed,
            r.read_count,
            r.write_count,
            r.last_committed_id.map(|n| n.to_string()).unwrap_or_else(|| "-".into()),
            r.started_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".into()),
        );
        if let Some(msg) = &r.exit_message
            && r.status == BatchStatus::Failed
        {
            println!("       ↳ {msg}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "eruna=debug,eruna_batch=debug"
    } else {
        "eruna=info,eruna_batch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => ErunaConfig::load_from(&PathBuf::from(shellexpand::tilde(path).to_string()))?,
        None => ErunaConfig::load()?,
    };

    match cli.command {
        Command::Today => {
            let clock = DayClock::from_offset_minutes(config.batch.utc_offset_minutes);
            println!("{} ({})", clock.today(), clock.date_at(Utc::now()));
        }
        Command::SeedAlarm { label, time, days } => {
            let app = App::open(config)?;
            let alarm = app.store.insert_alarm(&label, parse_time(&time)?, &parse_days(&days)?)?;
            let tokens: Vec<&str> = alarm.days.iter().map(|d| d.as_str()).collect();
            println!(
                "✅ alarm {} '{}' at {} on [{}]",
                alarm.id,
                alarm.label,
                alarm.alarm_time,
                tokens.join(",")
            );
        }
        Command::Executions { limit } => {
            let app = App::open(config)?;
            let records = app.ledger.recent(&app.config.batch.job_name, limit)?;
            print_executions(&records);
        }
        Command::RunNow { day } => {
            let day = day.as_deref().map(str::parse::<Week>).transpose()?;
            let app = App::open(config)?;
            let runner = app.runner(false);
            let trigger = app.trigger(runner.clone())?;
            let watcher = watch_ctrl_c(runner.stop_handle(), Arc::new(Notify::new()));
            let record = trigger.fire_for(Utc::now(), day).await?;
            watcher.abort();
            finish(&record)?;
        }
        Command::Restart {
            execution_id,
            allow_restart,
            abandon_stale,
        } => {
            let app = App::open(config)?;
            let prior = app
                .ledger
                .get(execution_id)?
                .with_context(|| format!("execution {execution_id} not found"))?;
            let runner = app.runner(allow_restart);
            if prior.job_name != runner.settings().job_name {
                anyhow::bail!(
                    "execution {execution_id} belongs to job '{}', not '{}'",
                    prior.job_name,
                    runner.settings().job_name
                );
            }
            if !prior.status.is_terminal() {
                if !abandon_stale {
                    anyhow::bail!(
                        "execution {execution_id} is still {}; if its process is gone, pass --abandon-stale",
                        prior.status
                    );
                }
                app.ledger.abandon(execution_id, "abandoned by restart --abandon-stale")?;
            }
            let watcher = watch_ctrl_c(runner.stop_handle(), Arc::new(Notify::new()));
            let record = runner.run(prior.parameters).await?;
            watcher.abort();
            finish(&record)?;
        }
        Command::Daemon => {
            let app = App::open(config)?;
            let runner = app.runner(false);
            let trigger = app.trigger(runner.clone())?;

            println!("⏰ Eruna v{}", env!("CARGO_PKG_VERSION"));
            println!("   📋 Job:      {}", app.config.batch.job_name);
            println!("   🕛 Cron:     {}", trigger.schedule().expression());
            println!("   🗄️  Database: {}", app.config.database.resolved_path().display());
            if let Some(next) = trigger.next_fire(Utc::now()) {
                println!("   ⏭️  Next:     {next}");
            }
            println!();

            let shutdown = Arc::new(Notify::new());
            let watcher = watch_ctrl_c(runner.stop_handle(), shutdown.clone());
            trigger.run_forever(shutdown).await?;
            watcher.abort();
        }
    }

    Ok(())
}
