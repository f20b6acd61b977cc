//! Per-alarm stage between the reader and the writer.

use std::sync::Arc;

use eruna_core::{Alarm, ErunaError, ProcessorKind, Result, Week};

use crate::store::AlarmStore;

/// Outcome of processing one alarm.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    /// Forward to the writer (possibly transformed).
    Keep(Alarm),
    /// Drop from the chunk before writing.
    Skip,
}

/// Transform or validate one alarm. An `Err` aborts the containing chunk.
pub trait AlarmProcessor: Send + Sync {
    fn process(&self, alarm: Alarm, day: Week) -> Result<Processed>;

    fn name(&self) -> &str;
}

/// Forwards every alarm unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl AlarmProcessor for PassThrough {
    fn process(&self, alarm: Alarm, _day: Week) -> Result<Processed> {
        Ok(Processed::Keep(alarm))
    }

    fn name(&self) -> &str {
        "pass_through"
    }
}

/// Re-reads each alarm and skips the ones deleted or rescheduled off `day`
/// since the page was fetched.
pub struct Revalidate {
    store: Arc<dyn AlarmStore>,
}

impl Revalidate {
    pub fn new(store: Arc<dyn AlarmStore>) -> Self {
        Self { store }
    }
}

impl AlarmProcessor for Revalidate {
    fn process(&self, alarm: Alarm, day: Week) -> Result<Processed> {
        let current = self.store.find_alarm(alarm.id).map_err(|e| ErunaError::Processor {
            alarm_id: alarm.id,
            reason: e.to_string(),
        })?;
        match current {
            Some(fresh) if fresh.fires_on(day) => Ok(Processed::Keep(fresh)),
            Some(_) => {
                tracing::debug!(alarm_id = alarm.id, %day, "alarm no longer due today, skipping");
                Ok(Processed::Skip)
            }
            None => {
                tracing::debug!(alarm_id = alarm.id, "alarm deleted since read, skipping");
                Ok(Processed::Skip)
            }
        }
    }

    fn name(&self) -> &str {
        "revalidate"
    }
}

/// Build the configured processor.
pub fn processor_for(kind: ProcessorKind, store: Arc<dyn AlarmStore>) -> Arc<dyn AlarmProcessor> {
    match kind {
        ProcessorKind::PassThrough => Arc::new(PassThrough),
        ProcessorKind::Revalidate => Arc::new(Revalidate::new(store)),
    }
}
