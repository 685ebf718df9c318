//! Alarm interval log.
//!
//! Each tracked alarm field is a byte (or bit) signal. While its value is
//! non-zero the alarm is active and the log holds one open interval for it
//! (start time set, end time null). When the value returns to zero, the most
//! recent open interval for that name is closed.
//!
//! The last-seen value of every field starts at zero when the process starts;
//! it is not reconstructed from the log.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::SignalId;
use crate::clock::{format_timestamp, parse_timestamp, Clock, SystemClock};
use crate::error::{PlcError, Result};
use crate::event::{Event, EventSender};
use crate::snapshot::{Snapshot, SnapshotConsumer};
use crate::storage::Storage;

/// Names of the tracked alarm fields, in display order.
pub const ALARM_FIELDS: [&str; 7] = [
    "急停状态",
    "碰撞检测",
    "超软限位故障",
    "安全停止信号SIO",
    "安全停止信号SII",
    "主故障码",
    "子故障码",
];

/// Days an interval is kept after its start.
pub const DEFAULT_RETENTION_DAYS: u32 = 180;

/// One tracked alarm field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmField {
    /// Alarm name written to the log.
    pub name: String,
    /// Signal whose non-zero value means "active".
    pub signal: SignalId,
}

/// Returns the reference machine's alarm fields.
pub fn default_alarm_fields() -> Vec<AlarmField> {
    [1011, 1019, 1013, 1023, 1025, 1015, 1017]
        .into_iter()
        .zip(ALARM_FIELDS)
        .map(|(offset, name)| AlarmField {
            name: name.to_string(),
            signal: SignalId::byte(offset),
        })
        .collect()
}

/// One logged alarm occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmInterval {
    /// Row id.
    pub id: i64,
    /// Alarm name.
    pub name: String,
    /// Always 1 for a logged occurrence.
    pub alarm_value: i64,
    /// Raw field value that opened the interval.
    pub code: i64,
    /// When the alarm became active.
    pub start_time: NaiveDateTime,
    /// When it cleared; `None` while still active.
    pub end_time: Option<NaiveDateTime>,
}

impl AlarmInterval {
    /// Returns whether the alarm is still active.
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let start: String = row.get(4)?;
        let end: Option<String> = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            alarm_value: row.get(2)?,
            code: row.get(3)?,
            start_time: parse_timestamp(&start).unwrap_or_default(),
            end_time: end.as_deref().and_then(parse_timestamp),
        })
    }
}

/// Filter for [`AlarmStore::query`]. Dates are inclusive and apply to start time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmQuery {
    /// First day included.
    pub from: Option<NaiveDate>,
    /// Last day included.
    pub to: Option<NaiveDate>,
    /// Only this alarm name.
    pub name: Option<String>,
}

/// Persistent alarm intervals.
#[derive(Debug, Clone)]
pub struct AlarmStore {
    storage: Storage,
}

impl AlarmStore {
    /// Creates a store on shared storage.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Appends an open interval.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the insert fails.
    pub fn open_interval(&self, name: &str, code: i64, start: NaiveDateTime) -> Result<i64> {
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alarm_log (alarm_name, alarm_value, code, start_time, end_time) \
                 VALUES (?1, 1, ?2, ?3, NULL)",
                params![name, code, format_timestamp(start)],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Closes the most recent open interval of `name`.
    ///
    /// Returns `false` if there was none.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the update fails.
    pub fn close_interval(&self, name: &str, end: NaiveDateTime) -> Result<bool> {
        self.storage.with_conn(|conn| {
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM alarm_log WHERE alarm_name = ?1 AND end_time IS NULL \
                     ORDER BY start_time DESC, id DESC LIMIT 1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            match id {
                Some(id) => {
                    conn.execute(
                        "UPDATE alarm_log SET end_time = ?1 WHERE id = ?2",
                        params![format_timestamp(end), id],
                    )?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Deletes intervals that started more than `retention_days` before `now`.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the delete fails.
    pub fn purge(&self, now: NaiveDateTime, retention_days: u32) -> Result<usize> {
        let cutoff = now - ChronoDuration::days(i64::from(retention_days));
        let removed = self.storage.with_conn(|conn| {
            conn.execute(
                "DELETE FROM alarm_log WHERE start_time < ?1",
                params![format_timestamp(cutoff)],
            )
        })?;
        info!(removed, cutoff = %format_timestamp(cutoff), "purged old alarm intervals");
        Ok(removed)
    }

    /// Returns matching intervals, newest start first.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn query(&self, query: &AlarmQuery) -> Result<Vec<AlarmInterval>> {
        let mut sql = String::from(
            "SELECT id, alarm_name, alarm_value, code, start_time, end_time FROM alarm_log WHERE 1 = 1",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(from) = query.from {
            args.push(format_timestamp(from.and_time(chrono::NaiveTime::MIN)));
            sql.push_str(&format!(" AND start_time >= ?{}", args.len()));
        }
        if let Some(to) = query.to {
            let end = to
                .succ_opt()
                .map(|d| format_timestamp(d.and_time(chrono::NaiveTime::MIN)))
                .unwrap_or_else(|| "9999-12-31T23:59:59".to_string());
            args.push(end);
            sql.push_str(&format!(" AND start_time < ?{}", args.len()));
        }
        if let Some(name) = &query.name {
            args.push(name.clone());
            sql.push_str(&format!(" AND alarm_name = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY start_time DESC, id DESC");

        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), AlarmInterval::from_row)?;
            rows.collect()
        })
    }

    /// Returns every interval that is still open.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn open_intervals(&self) -> Result<Vec<AlarmInterval>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, alarm_name, alarm_value, code, start_time, end_time FROM alarm_log \
                 WHERE end_time IS NULL ORDER BY start_time DESC, id DESC",
            )?;
            let rows = stmt.query_map([], AlarmInterval::from_row)?;
            rows.collect()
        })
    }
}

/// What a value change did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmTransition {
    /// Value unchanged.
    Unchanged,
    /// Zero to non-zero: interval opened.
    Raised,
    /// Non-zero to zero: interval closed.
    Cleared,
    /// Non-zero to a different non-zero value: closed and reopened.
    Changed,
}

#[derive(Debug)]
struct TrackedField {
    field: AlarmField,
    last: i64,
}

/// Turns alarm field transitions into logged intervals.
pub struct AlarmLogger {
    fields: Vec<TrackedField>,
    store: AlarmStore,
    clock: Arc<dyn Clock>,
    events: EventSender,
}

impl AlarmLogger {
    /// Creates a logger for `fields`, all starting at zero.
    pub fn new(fields: Vec<AlarmField>, store: AlarmStore, events: EventSender) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|field| TrackedField { field, last: 0 })
                .collect(),
            store,
            clock: Arc::new(SystemClock),
            events,
        }
    }

    /// Replaces the clock used by [`log_state_change`](Self::log_state_change)
    /// and [`purge_expired`](Self::purge_expired).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the store.
    pub fn store(&self) -> &AlarmStore {
        &self.store
    }

    /// Returns the last value seen for `name`.
    pub fn last_value(&self, name: &str) -> Option<i64> {
        self.fields
            .iter()
            .find(|t| t.field.name == name)
            .map(|t| t.last)
    }

    /// Purges intervals older than `retention_days`.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the delete fails.
    pub fn purge_expired(&self, retention_days: u32) -> Result<usize> {
        self.store.purge(self.clock.now(), retention_days)
    }

    /// Records the current value of alarm `name` at the clock's time.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for an untracked name. Storage
    /// failures are logged and emitted as [`Event::Error`], not returned.
    pub fn log_state_change(&mut self, name: &str, value: i64) -> Result<AlarmTransition> {
        let index = self
            .fields
            .iter()
            .position(|t| t.field.name == name)
            .ok_or_else(|| PlcError::invalid_parameter("name", format!("unknown alarm '{}'", name)))?;
        let now = self.clock.now();
        Ok(self.apply(index, value, now))
    }

    fn apply(&mut self, index: usize, value: i64, at: NaiveDateTime) -> AlarmTransition {
        let last = self.fields[index].last;
        self.fields[index].last = value;
        if value == last {
            return AlarmTransition::Unchanged;
        }
        let name = self.fields[index].field.name.clone();

        if last != 0 {
            match self.store.close_interval(&name, at) {
                Ok(true) => {}
                Ok(false) => debug!(alarm = %name, "no open interval to close"),
                Err(e) => {
                    warn!(alarm = %name, error = %e, "failed to close alarm interval");
                    self.events.send(Event::Error {
                        message: format!("failed to close alarm interval '{}': {}", name, e),
                    });
                }
            }
        }
        if value != 0 {
            if let Err(e) = self.store.open_interval(&name, value, at) {
                warn!(alarm = %name, error = %e, "failed to open alarm interval");
                self.events.send(Event::Error {
                    message: format!("failed to open alarm interval '{}': {}", name, e),
                });
            }
        }

        match (last != 0, value != 0) {
            (false, true) => {
                warn!(alarm = %name, value, "alarm raised");
                self.events.send(Event::AlarmRaised { name, value });
                AlarmTransition::Raised
            }
            (true, false) => {
                info!(alarm = %name, "alarm cleared");
                self.events.send(Event::AlarmCleared { name });
                AlarmTransition::Cleared
            }
            _ => {
                warn!(alarm = %name, from = last, to = value, "alarm code changed");
                self.events.send(Event::AlarmRaised { name, value });
                AlarmTransition::Changed
            }
        }
    }
}

impl SnapshotConsumer for AlarmLogger {
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        for index in 0..self.fields.len() {
            if let Some(value) = snapshot.get(&self.fields[index].field.signal) {
                self.apply(index, value.as_i64(), snapshot.taken_at());
            }
        }
    }

    fn name(&self) -> &str {
        "alarm logger"
    }
}

impl std::fmt::Debug for AlarmLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlarmLogger")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}
