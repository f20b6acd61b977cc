//! Chunk writer: resolves each alarm's group, then dispatches it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use eruna_core::{Alarm, ErunaError, Result};

use crate::dispatch::AlarmDispatcher;
use crate::store::GroupStore;

/// Consumes one processed chunk. An `Err` fails the chunk; items are written in order.
/// `ring_date` is the date the run plans the alarms for.
#[async_trait]
pub trait AlarmWriter: Send + Sync {
    async fn write(&self, chunk: &[Alarm], ring_date: NaiveDate) -> Result<()>;
}

/// Resolve-or-create the group of every alarm, then hand both to the dispatcher.
pub struct GroupingAlarmWriter {
    groups: Arc<dyn GroupStore>,
    dispatcher: Arc<dyn AlarmDispatcher>,
}

impl GroupingAlarmWriter {
    pub fn new(groups: Arc<dyn GroupStore>, dispatcher: Arc<dyn AlarmDispatcher>) -> Self {
        Self { groups, dispatcher }
    }
}

#[async_trait]
impl AlarmWriter for GroupingAlarmWriter {
    async fn write(&self, chunk: &[Alarm], ring_date: NaiveDate) -> Result<()> {
        for alarm in chunk {
            let group = self
                .groups
                .resolve_or_create_group(alarm)
                .await
                .map_err(|e| ErunaError::WriteFailed {
                    alarm_id: alarm.id,
                    reason: format!("group: {e}"),
                })?;

            self.dispatcher
                .dispatch(alarm, &group, ring_date)
                .await
                .map_err(|e| ErunaError::WriteFailed {
                    alarm_id: alarm.id,
                    reason: format!("{}: {e}", self.dispatcher.name()),
                })?;

            tracing::debug!(
                alarm_id = alarm.id,
                group_id = group.id,
                dispatcher = self.dispatcher.name(),
                "alarm written"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteAlarmStore;
    use chrono::NaiveTime;
    use eruna_core::{GroupRef, Week};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(i64, i64)>>,
        fail_on: Option<i64>,
    }

    #[async_trait]
    impl AlarmDispatcher for Recording {
        async fn dispatch(&self, alarm: &Alarm, group: &GroupRef, _date: NaiveDate) -> Result<()> {
            if self.fail_on == Some(alarm.id) {
                return Err(ErunaError::Dispatch("refused".into()));
            }
            self.seen.lock().unwrap().push((alarm.id, group.id));
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn store() -> (Arc<SqliteAlarmStore>, Vec<Alarm>) {
        let store = SqliteAlarmStore::open_in_memory().unwrap();
        let t = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let alarms = (0..3)
            .map(|i| store.insert_alarm(&format!("a{i}"), t, &[Week::Mon]).unwrap())
            .collect();
        (Arc::new(store), alarms)
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    #[tokio::test]
    async fn test_writes_in_order_with_groups() {
        let (store, alarms) = store();
        let dispatcher = Arc::new(Recording::default());
        let writer = GroupingAlarmWriter::new(store.clone(), dispatcher.clone());

        writer.write(&alarms, monday()).await.unwrap();

        let seen = dispatcher.seen.lock().unwrap().clone();
        let ids: Vec<i64> = seen.iter().map(|(a, _)| *a).collect();
        assert_eq!(ids, alarms.iter().map(|a| a.id).collect::<Vec<_>>());
        assert_eq!(store.group_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_failure_names_alarm() {
        let (store, alarms) = store();
        let dispatcher = Arc::new(Recording {
            fail_on: Some(alarms[1].id),
            ..Default::default()
        });
        let writer = GroupingAlarmWriter::new(store, dispatcher.clone());

        let err = writer.write(&alarms, monday()).await.unwrap_err();
        assert_eq!(err.alarm_id(), Some(alarms[1].id));
        assert!(matches!(err, ErunaError::WriteFailed { .. }));
        assert_eq!(dispatcher.seen.lock().unwrap().len(), 1);
    }
}
