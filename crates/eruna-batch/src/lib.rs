//! # Eruna Batch
//!
//! Daily alarm batch: every day the trigger reads the alarms due today,
//! groups them and hands them to the notification side, in chunks.
//!
//! ## Design Principles
//! - Single SQLite file for alarms, groups, executions and planned fires
//! - Chunk-sized units of work: a failing chunk never undoes earlier ones
//! - Restartable: the ledger keeps the id of the last committed alarm
//! - Tokio timers only, idle between fire times
//!
//! ## Architecture
//! ```text
//! CronTrigger ("0 0 0 * * *")
//!   ├── PendingWork::clear_scope(job)
//!   ├── RunIdIncrementer → {run.id, launchDate}
//!   └── JobRunner::run(params)
//!         ├── ExecutionLedger (job_execution)
//!         ├── PagedAlarmSource (Paged | AssociationScan) → AlarmFeed
//!         ├── AlarmProcessor (PassThrough | Revalidate)
//!         └── GroupingAlarmWriter
//!               ├── GroupStore::resolve_or_create_group
//!               └── AlarmDispatcher
//!                     ├── FireSchedule (scheduled_fire)
//!                     └── Webhook (HTTP POST)
//! ```

pub mod cron;
pub mod day;
pub mod dispatch;
pub mod ledger;
pub mod params;
pub mod processor;
pub mod reader;
pub mod runner;
pub mod schedule;
pub mod store;
pub mod trigger;
pub mod writer;

pub use cron::CronSchedule;
pub use day::{DayClock, today_for};
pub use dispatch::{
    AlarmDispatcher, FanoutDispatcher, FireScheduleDispatcher, WebhookDispatcher,
    dispatcher_from_config,
};
pub use ledger::{BatchStatus, ChunkProgress, ExecutionLedger, ExecutionRecord};
pub use params::{JobParameters, ParamValue, RunIdIncrementer, RunIdentity};
pub use processor::{AlarmProcessor, PassThrough, Processed, Revalidate, processor_for};
pub use reader::{AlarmFeed, Page, PageCursor, PagedAlarmSource, ReadStrategy};
pub use runner::{JobRunner, JobSettings, JobSummary, StopHandle};
pub use schedule::{FireSchedule, PendingWork, ScheduledFire};
pub use store::{AlarmStore, ChunkTransaction, GroupStore, SqliteAlarmStore};
pub use trigger::CronTrigger;
pub use writer::{AlarmWriter, GroupingAlarmWriter};
