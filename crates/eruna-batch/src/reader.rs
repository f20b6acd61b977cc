//! Paged, restartable reader of the alarms due on one day.
//!
//! Both strategies hand alarms out in ascending id order, so the id of the
//! last committed alarm is a complete restart position.

use std::collections::VecDeque;
use std::sync::Arc;

use eruna_core::{Alarm, DayOfWeekAssociation, ReaderKind, Result, Week};

use crate::store::AlarmStore;

/// How pages are pulled from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Day-filtered query, one page per round trip.
    Paged,
    /// Walk association rows and map the ones matching the day to alarms.
    AssociationScan,
}

impl From<ReaderKind> for ReadStrategy {
    fn from(kind: ReaderKind) -> Self {
        match kind {
            ReaderKind::Paged => ReadStrategy::Paged,
            ReaderKind::AssociationScan => ReadStrategy::AssociationScan,
        }
    }
}

/// One page of due alarms.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page number within this cursor.
    pub number: u64,
    pub alarms: Vec<Alarm>,
}

/// Position of an open read.
#[derive(Debug, Clone)]
pub struct PageCursor {
    day: Week,
    last_alarm_id: Option<i64>,
    last_association: Option<DayOfWeekAssociation>,
    pages_read: u64,
    exhausted: bool,
}

impl PageCursor {
    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

/// Lazy paginated sequence of alarms due on a given day.
#[derive(Clone)]
pub struct PagedAlarmSource {
    store: Arc<dyn AlarmStore>,
    strategy: ReadStrategy,
    page_size: usize,
}

impl PagedAlarmSource {
    pub fn new(store: Arc<dyn AlarmStore>, strategy: ReadStrategy, page_size: usize) -> Self {
        Self {
            store,
            strategy,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Open a cursor for `day`. `resume_after` skips every alarm id up to and including it.
    pub fn open(&self, day: Week, resume_after: Option<i64>) -> PageCursor {
        PageCursor {
            day,
            last_alarm_id: resume_after,
            last_association: resume_after.map(|alarm_id| DayOfWeekAssociation {
                alarm_id,
                day: Week::Mon,
            }),
            pages_read: 0,
            exhausted: false,
        }
    }

    /// Next page, or None once the day's alarms are exhausted.
    pub fn next_page(&self, cursor: &mut PageCursor) -> Result<Option<Page>> {
        if cursor.exhausted {
            return Ok(None);
        }

        let alarms = match self.strategy {
            ReadStrategy::Paged => self.next_paged(cursor)?,
            ReadStrategy::AssociationScan => self.next_scanned(cursor)?,
        };

        if alarms.is_empty() {
            cursor.exhausted = true;
            return Ok(None);
        }

        cursor.pages_read += 1;
        tracing::debug!(
            day = %cursor.day,
            page = cursor.pages_read,
            alarms = alarms.len(),
            "page read"
        );
        Ok(Some(Page {
            number: cursor.pages_read,
            alarms,
        }))
    }

    fn next_paged(&self, cursor: &mut PageCursor) -> Result<Vec<Alarm>> {
        let alarms = self
            .store
            .alarms_for_day(cursor.day, cursor.last_alarm_id, self.page_size)?;
        if alarms.len() < self.page_size {
            cursor.exhausted = true;
        }
        if let Some(last) = alarms.last() {
            cursor.last_alarm_id = Some(last.id);
        }
        Ok(alarms)
    }

    fn next_scanned(&self, cursor: &mut PageCursor) -> Result<Vec<Alarm>> {
        let mut alarms = Vec::new();

        while alarms.len() < self.page_size {
            let rows = self
                .store
                .associations(cursor.last_association, self.page_size)?;
            let fetched = rows.len();
            let mut consumed = 0;

            for row in rows {
                if alarms.len() == self.page_size {
                    break;
                }
                consumed += 1;
                cursor.last_association = Some(row);
                if row.day != cursor.day || cursor.last_alarm_id.is_some_and(|id| row.alarm_id <= id) {
                    continue;
                }
                // Row may outlive its alarm while the scan runs.
                if let Some(alarm) = self.store.find_alarm(row.alarm_id)? {
                    cursor.last_alarm_id = Some(alarm.id);
                    alarms.push(alarm);
                }
            }

            if fetched < self.page_size && consumed == fetched {
                cursor.exhausted = true;
                break;
            }
        }

        Ok(alarms)
    }
}

/// Buffers pages so chunks can be cut at any size.
pub struct AlarmFeed {
    source: PagedAlarmSource,
    cursor: PageCursor,
    buffer: VecDeque<Alarm>,
}

impl AlarmFeed {
    pub fn new(source: PagedAlarmSource, cursor: PageCursor) -> Self {
        Self {
            source,
            cursor,
            buffer: VecDeque::new(),
        }
    }

    /// Up to `size` alarms in source order; empty when nothing is left.
    pub fn take(&mut self, size: usize) -> Result<Vec<Alarm>> {
        while self.buffer.len() < size {
            match self.source.next_page(&mut self.cursor)? {
                Some(page) => self.buffer.extend(page.alarms),
                None => break,
            }
        }
        let n = size.min(self.buffer.len());
        Ok(self.buffer.drain(..n).collect())
    }

    pub fn pages_read(&self) -> u64 {
        self.cursor.pages_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteAlarmStore;
    use chrono::NaiveTime;

    fn store_with(n: usize) -> Arc<SqliteAlarmStore> {
        let store = SqliteAlarmStore::open_in_memory().unwrap();
        let t = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        for i in 0..n {
            // Every third alarm recurs on Tuesday only.
            let days: &[Week] = if i % 3 == 2 { &[Week::Tue] } else { &[Week::Mon, Week::Fri] };
            store.insert_alarm(&format!("alarm-{i}"), t, days).unwrap();
        }
        Arc::new(store)
    }

    fn drain(source: &PagedAlarmSource, cursor: &mut PageCursor) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Some(page) = source.next_page(cursor).unwrap() {
            assert!(page.alarms.len() <= source.page_size());
            ids.extend(page.alarms.iter().map(|a| a.id));
        }
        ids
    }

    #[test]
    fn test_paged_reads_only_matching_day_in_order() {
        let store = store_with(25);
        let source = PagedAlarmSource::new(store.clone(), ReadStrategy::Paged, 4);
        let mut cursor = source.open(Week::Mon, None);
        let ids = drain(&source, &mut cursor);

        let expected: Vec<i64> = (1..=25).filter(|id| (id - 1) % 3 != 2).collect();
        assert_eq!(ids, expected);
        assert!(cursor.is_exhausted());
        assert_eq!(cursor.pages_read(), expected.len().div_ceil(4) as u64);
        assert!(source.next_page(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_both_strategies_agree() {
        let store = store_with(40);
        for day in Week::ALL {
            let paged = PagedAlarmSource::new(store.clone(), ReadStrategy::Paged, 10);
            let scan = PagedAlarmSource::new(store.clone(), ReadStrategy::AssociationScan, 10);
            let a = drain(&paged, &mut paged.open(day, None));
            let b = drain(&scan, &mut scan.open(day, None));
            assert_eq!(a, b, "day {day}");
        }
    }

    #[test]
    fn test_resume_skips_committed_ids() {
        let store = store_with(12);
        for strategy in [ReadStrategy::Paged, ReadStrategy::AssociationScan] {
            let source = PagedAlarmSource::new(store.clone(), strategy, 3);
            let ids = drain(&source, &mut source.open(Week::Mon, Some(5)));
            assert!(ids.iter().all(|id| *id > 5), "{strategy:?}: {ids:?}");
            assert_eq!(ids.first(), Some(&7));
        }
    }

    #[test]
    fn test_empty_day_is_exhausted_immediately() {
        let store = store_with(6);
        let source = PagedAlarmSource::new(store, ReadStrategy::Paged, 10);
        let mut cursor = source.open(Week::Sun, None);
        assert!(source.next_page(&mut cursor).unwrap().is_none());
        assert_eq!(cursor.pages_read(), 0);
    }

    #[test]
    fn test_feed_cuts_chunks_across_pages() {
        let store = store_with(30);
        let source = PagedAlarmSource::new(store, ReadStrategy::Paged, 10);
        let cursor = source.open(Week::Mon, None);
        let mut feed = AlarmFeed::new(source, cursor);

        let first = feed.take(7).unwrap();
        let second = feed.take(7).unwrap();
        let third = feed.take(7).unwrap();
        let fourth = feed.take(7).unwrap();
        assert_eq!(first.len(), 7);
        assert_eq!(second.len(), 7);
        assert_eq!(third.len(), 6);
        assert!(fourth.is_empty());
        assert!(first.last().unwrap().id < second.first().unwrap().id);
    }
}
