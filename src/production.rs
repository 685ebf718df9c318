//! Daily production tally.
//!
//! Every rising edge of the trigger adds one piece to the tally of the
//! counter's current date. The current date follows the wall clock through a
//! periodic check (once a minute by default), which never touches stored
//! tallies.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::SignalId;
use crate::clock::{format_date, Clock, SystemClock, DATE_FORMAT};
use crate::edge::EdgeTracker;
use crate::error::Result;
use crate::event::{Event, EventSender};
use crate::snapshot::{Snapshot, SnapshotConsumer};
use crate::storage::Storage;

/// Configuration of the production counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductionConfig {
    /// Signal whose rising edge counts one piece.
    pub trigger: SignalId,
    /// How often the calendar date is re-read from the clock.
    #[serde(with = "crate::engine::millis")]
    pub date_check_interval: Duration,
}

impl Default for ProductionConfig {
    fn default() -> Self {
        Self {
            trigger: SignalId::Bit {
                offset: 750,
                bit: 0,
            },
            date_check_interval: Duration::from_secs(60),
        }
    }
}

/// Count for one calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductionTally {
    /// Calendar date.
    pub date: NaiveDate,
    /// Pieces produced.
    pub count: u64,
}

/// Persistent tallies, unique per date.
#[derive(Debug, Clone)]
pub struct ProductionStore {
    storage: Storage,
}

impl ProductionStore {
    /// Creates a store on shared storage.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Adds one piece to `date`, creating the row if needed, and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the update fails.
    pub fn increment(&self, date: NaiveDate) -> Result<u64> {
        let key = format_date(date);
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO production (date, count) VALUES (?1, 1) \
                 ON CONFLICT (date) DO UPDATE SET count = count + 1",
                params![key],
            )?;
            conn.query_row(
                "SELECT count FROM production WHERE date = ?1",
                params![key],
                |row| row.get(0),
            )
        })
    }

    /// Returns the tally of `date` (0 if none).
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn count_for(&self, date: NaiveDate) -> Result<u64> {
        let count: Option<u64> = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT count FROM production WHERE date = ?1",
                params![format_date(date)],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(count.unwrap_or(0))
    }

    /// Returns tallies matching the given calendar parts, newest date first.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn query(
        &self,
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
    ) -> Result<Vec<ProductionTally>> {
        let mut sql = String::from("SELECT date, count FROM production WHERE 1 = 1");
        let mut args: Vec<String> = Vec::new();
        for (part, value) in [
            ("%Y", year.map(|y| format!("{:04}", y))),
            ("%m", month.map(|m| format!("{:02}", m))),
            ("%d", day.map(|d| format!("{:02}", d))),
        ] {
            if let Some(value) = value {
                args.push(value);
                sql.push_str(&format!(" AND strftime('{}', date) = ?{}", part, args.len()));
            }
        }
        sql.push_str(" ORDER BY date DESC");

        let rows: Vec<(String, u64)> = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect()
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(date, count)| {
                NaiveDate::parse_from_str(&date, DATE_FORMAT)
                    .ok()
                    .map(|date| ProductionTally { date, count })
            })
            .collect())
    }

    /// Deletes every tally.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the delete fails.
    pub fn clear_all(&self) -> Result<usize> {
        let removed = self
            .storage
            .with_conn(|conn| conn.execute("DELETE FROM production", []))?;
        info!(removed, "cleared production history");
        Ok(removed)
    }
}

/// Counts pieces into the tally of the current date.
pub struct ProductionCounter {
    trigger: SignalId,
    check_interval: Duration,
    store: ProductionStore,
    clock: Arc<dyn Clock>,
    events: EventSender,
    edge: EdgeTracker,
    current_date: NaiveDate,
    last_check: NaiveDateTime,
}

impl ProductionCounter {
    /// Creates a counter targeting today's date.
    pub fn new(config: &ProductionConfig, store: ProductionStore, events: EventSender) -> Self {
        Self::with_clock(config, store, events, Arc::new(SystemClock))
    }

    /// Creates a counter driven by `clock`.
    pub fn with_clock(
        config: &ProductionConfig,
        store: ProductionStore,
        events: EventSender,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            trigger: config.trigger,
            check_interval: config.date_check_interval,
            store,
            clock,
            events,
            edge: EdgeTracker::new(),
            current_date: now.date(),
            last_check: now,
        }
    }

    /// Returns the date increments currently go to.
    pub fn current_date(&self) -> NaiveDate {
        self.current_date
    }

    /// Returns the store.
    pub fn store(&self) -> &ProductionStore {
        &self.store
    }

    /// Returns the tally of the current date.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn today_count(&self) -> Result<u64> {
        self.store.count_for(self.current_date)
    }

    /// Re-reads the calendar date from the clock.
    ///
    /// Returns the new date if it changed.
    pub fn check_date(&mut self) -> Option<NaiveDate> {
        let now = self.clock.now();
        self.last_check = now;
        let today = now.date();
        if today == self.current_date {
            return None;
        }
        let from = self.current_date;
        self.current_date = today;
        info!(from = %from, to = %today, "production day changed");
        self.events.send(Event::ProductionDayChanged { from, to: today });
        Some(today)
    }

    fn check_date_if_due(&mut self) {
        let elapsed = self.clock.now() - self.last_check;
        if elapsed.to_std().map_or(false, |e| e >= self.check_interval) {
            self.check_date();
        }
    }

    /// Feeds the current trigger value.
    ///
    /// Returns the new tally on a counted edge. A storage failure is logged
    /// and emitted as [`Event::Error`]; the piece is lost.
    pub fn observe(&mut self, trigger: bool) -> Option<u64> {
        if !self.edge.observe(trigger).is_rising() {
            return None;
        }
        match self.store.increment(self.current_date) {
            Ok(count) => {
                debug!(date = %self.current_date, count, "production counted");
                self.events.send(Event::ProductionCounted {
                    date: self.current_date,
                    count,
                });
                Some(count)
            }
            Err(e) => {
                warn!(date = %self.current_date, error = %e, "failed to record production");
                self.events.send(Event::Error {
                    message: format!("failed to record production for {}: {}", self.current_date, e),
                });
                None
            }
        }
    }
}

impl SnapshotConsumer for ProductionCounter {
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        self.check_date_if_due();
        if let Some(trigger) = snapshot.bit(&self.trigger) {
            self.observe(trigger);
        }
    }

    fn name(&self) -> &str {
        "production"
    }
}

impl std::fmt::Debug for ProductionCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductionCounter")
            .field("trigger", &self.trigger)
            .field("current_date", &self.current_date)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::snapshot::SignalValue;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeMap;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn counter(clock: &ManualClock) -> ProductionCounter {
        ProductionCounter::with_clock(
            &ProductionConfig::default(),
            ProductionStore::new(Storage::in_memory().unwrap()),
            EventSender::discard(),
            Arc::new(clock.clone()),
        )
    }

    fn pulse(counter: &mut ProductionCounter) {
        counter.observe(true);
        counter.observe(false);
    }

    #[test]
    fn test_tallies_by_date() {
        let clock = ManualClock::at(date(2024, 1, 1).and_hms_opt(10, 0, 0).unwrap());
        let mut counter = counter(&clock);
        for _ in 0..3 {
            pulse(&mut counter);
        }
        clock.set(date(2024, 1, 2).and_hms_opt(8, 0, 0).unwrap());
        assert_eq!(counter.check_date(), Some(date(2024, 1, 2)));
        pulse(&mut counter);

        let rows = counter.store().query(None, None, None).unwrap();
        assert_eq!(
            rows,
            vec![
                ProductionTally {
                    date: date(2024, 1, 2),
                    count: 1
                },
                ProductionTally {
                    date: date(2024, 1, 1),
                    count: 3
                },
            ]
        );
        assert_eq!(counter.today_count().unwrap(), 1);
    }

    #[test]
    fn test_rollover_waits_for_date_check() {
        let clock = ManualClock::at(date(2024, 1, 1).and_hms_opt(23, 59, 30).unwrap());
        let mut counter = counter(&clock);
        let snapshot = |value: bool| {
            let mut values = BTreeMap::new();
            values.insert(SignalId::bit(750, 0).unwrap(), SignalValue::Bool(value));
            Snapshot::new(1, Default::default(), values)
        };

        clock.advance(ChronoDuration::seconds(40));
        counter.on_snapshot(&snapshot(true));
        counter.on_snapshot(&snapshot(false));
        assert_eq!(counter.current_date(), date(2024, 1, 1));

        clock.advance(ChronoDuration::seconds(30));
        counter.on_snapshot(&snapshot(true));
        assert_eq!(counter.current_date(), date(2024, 1, 2));
        assert_eq!(counter.store().count_for(date(2024, 1, 1)).unwrap(), 1);
        assert_eq!(counter.store().count_for(date(2024, 1, 2)).unwrap(), 1);
    }

    #[test]
    fn test_query_filters_and_clear() {
        let store = ProductionStore::new(Storage::in_memory().unwrap());
        store.increment(date(2023, 12, 31)).unwrap();
        store.increment(date(2024, 1, 5)).unwrap();
        store.increment(date(2024, 2, 5)).unwrap();
        assert_eq!(store.increment(date(2024, 2, 5)).unwrap(), 2);

        assert_eq!(store.query(Some(2024), None, None).unwrap().len(), 2);
        assert_eq!(store.query(None, Some(2), None).unwrap().len(), 1);
        assert_eq!(store.query(None, None, Some(5)).unwrap().len(), 2);
        assert_eq!(store.query(Some(2024), Some(1), Some(5)).unwrap()[0].count, 1);

        assert_eq!(store.clear_all().unwrap(), 3);
        assert_eq!(store.count_for(date(2024, 2, 5)).unwrap(), 0);
    }

    #[test]
    fn test_storage_failure_loses_piece_only() {
        let clock = ManualClock::at(date(2024, 1, 1).and_hms_opt(10, 0, 0).unwrap());
        let storage = Storage::in_memory().unwrap();
        let (tx, rx) = crate::event::channel(16);
        let mut counter = ProductionCounter::with_clock(
            &ProductionConfig::default(),
            ProductionStore::new(storage.clone()),
            tx,
            Arc::new(clock.clone()),
        );
        storage
            .with_conn(|conn| conn.execute_batch("DROP TABLE production"))
            .unwrap();

        assert_eq!(counter.observe(true), None);
        // the edge was consumed: holding the signal does not retry
        assert_eq!(counter.observe(true), None);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, Event::Error { message } if message.contains("2024-01-01"))));

        storage
            .with_conn(|conn| {
                conn.execute_batch("CREATE TABLE production (date TEXT PRIMARY KEY, count INTEGER NOT NULL DEFAULT 0)")
            })
            .unwrap();
        counter.observe(false);
        assert_eq!(counter.observe(true), Some(1));
    }
}
