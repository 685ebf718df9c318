//! Tool wear counting.
//!
//! A tool bank is a group of slots (`T0`..`T23` by default) that all count on
//! the rising edge of one shared trigger signal. A slot with a life limit of 0
//! is disabled. When a slot's count reaches its limit, the bank emits a
//! [`Event::ToolExpired`] once, sets the bank's attention output bit and stops
//! counting that slot until an operator acknowledges the change (new limit,
//! reason, operator; count reset; history written) or declines it (count
//! frozen at the limit; attention bit cleared).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use plcwatch::tool_life::{ToolBank, ToolBankConfig};
//! use plcwatch::{DeviceLink, SimulatedPlc};
//! use plcwatch::event::EventSender;
//!
//! let plc = SimulatedPlc::new(2048);
//! let link = Arc::new(DeviceLink::new(plc.clone()));
//! link.connect().unwrap();
//!
//! let mut bank = ToolBank::new(ToolBankConfig::default(), link, None, EventSender::discard());
//! bank.set_life_limit("T0", 2).unwrap();
//! bank.process_trigger(true);
//! bank.process_trigger(false);
//! bank.process_trigger(true);
//! assert!(plc.bit(750, 7));
//! assert_eq!(bank.pending(), vec!["T0".to_string()]);
//! ```

use std::sync::Arc;

use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::SignalId;
use crate::clock::{format_timestamp, parse_timestamp, Clock, SystemClock};
use crate::edge::EdgeTracker;
use crate::error::{PlcError, Result};
use crate::event::{Event, EventSender};
use crate::link::BitWriter;
use crate::snapshot::{Snapshot, SnapshotConsumer};
use crate::storage::Storage;

/// Number of slots in a bank unless configured otherwise.
pub const DEFAULT_TOOL_SLOTS: usize = 24;

/// Observable state of one tool slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSlot {
    /// Slot id, `T0`, `T1`, ...
    pub id: String,
    /// Triggers allowed before the tool must be changed; 0 disables counting.
    pub life_limit: u32,
    /// Triggers counted since the last reset.
    pub count: u32,
    /// Whether the next trigger edge will be counted.
    pub active: bool,
    /// Whether the slot is expired and waiting for the operator.
    pub awaiting_ack: bool,
    /// When the count was last reset.
    pub counting_since: NaiveDateTime,
}

/// Result of feeding one trigger value to a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    /// Nothing counted.
    Idle,
    /// Count incremented to the given value.
    Counted(u32),
    /// Count reached the limit; reported once per expiration.
    Expired(u32),
}

/// Wear counter of one slot.
#[derive(Debug, Clone)]
pub struct ToolLifeCounter {
    id: String,
    life_limit: u32,
    count: u32,
    expired: bool,
    awaiting_ack: bool,
    counting_since: NaiveDateTime,
    edge: EdgeTracker,
}

impl ToolLifeCounter {
    /// Creates a disabled counter.
    pub fn new(id: impl Into<String>, now: NaiveDateTime) -> Self {
        Self {
            id: id.into(),
            life_limit: 0,
            count: 0,
            expired: false,
            awaiting_ack: false,
            counting_since: now,
            edge: EdgeTracker::new(),
        }
    }

    /// Returns the slot id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns a copy of the slot state.
    pub fn slot(&self) -> ToolSlot {
        ToolSlot {
            id: self.id.clone(),
            life_limit: self.life_limit,
            count: self.count,
            active: self.life_limit > 0 && self.count < self.life_limit,
            awaiting_ack: self.awaiting_ack,
            counting_since: self.counting_since,
        }
    }

    /// Feeds the current trigger value.
    ///
    /// The edge tracker is updated even while the slot is disabled or
    /// expired, so re-enabling never produces a spurious edge.
    pub fn observe(&mut self, trigger: bool) -> ToolOutcome {
        let edge = self.edge.observe(trigger);
        if self.life_limit == 0 || !edge.is_rising() || self.count >= self.life_limit {
            return ToolOutcome::Idle;
        }
        self.count += 1;
        if self.count >= self.life_limit && !self.expired {
            self.expired = true;
            self.awaiting_ack = true;
            return ToolOutcome::Expired(self.count);
        }
        ToolOutcome::Counted(self.count)
    }

    /// Completes a tool change: installs `new_limit` and restarts counting.
    ///
    /// Returns when the previous count started.
    pub fn acknowledge(&mut self, new_limit: u32, now: NaiveDateTime) -> NaiveDateTime {
        let started = self.counting_since;
        self.life_limit = new_limit;
        self.restart(now);
        started
    }

    /// Declines a tool change: the count stays frozen at the limit.
    pub fn decline(&mut self) {
        self.awaiting_ack = false;
    }

    /// Installs a new limit and restarts counting.
    pub fn set_life_limit(&mut self, limit: u32, now: NaiveDateTime) {
        self.life_limit = limit;
        self.restart(now);
    }

    /// Restarts counting from zero.
    pub fn reset_count(&mut self, now: NaiveDateTime) {
        self.restart(now);
    }

    fn restart(&mut self, now: NaiveDateTime) {
        self.count = 0;
        self.expired = false;
        self.awaiting_ack = false;
        self.counting_since = now;
    }
}

/// Configuration of one tool bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolBankConfig {
    /// Bank name used in history and events.
    pub name: String,
    /// Signal whose rising edge counts one use of every enabled tool.
    pub trigger: SignalId,
    /// Output bit set while a tool change is pending.
    pub attention: SignalId,
    /// Number of slots.
    pub slots: usize,
}

impl Default for ToolBankConfig {
    fn default() -> Self {
        Self {
            name: "machine_a".to_string(),
            trigger: SignalId::Bit {
                offset: 600,
                bit: 0,
            },
            attention: SignalId::Bit {
                offset: 750,
                bit: 7,
            },
            slots: DEFAULT_TOOL_SLOTS,
        }
    }
}

impl ToolBankConfig {
    /// Returns the reference machine's two banks.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::default(),
            Self {
                name: "machine_b".to_string(),
                trigger: SignalId::Bit {
                    offset: 800,
                    bit: 0,
                },
                attention: SignalId::Bit {
                    offset: 800,
                    bit: 7,
                },
                slots: DEFAULT_TOOL_SLOTS,
            },
        ]
    }
}

/// A completed tool change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolChangeRecord {
    /// Bank name.
    pub bank: String,
    /// Slot id.
    pub tool_id: String,
    /// When the replaced tool started counting.
    pub start_time: NaiveDateTime,
    /// When the change was acknowledged.
    pub end_time: NaiveDateTime,
    /// Operator-supplied reason.
    pub change_reason: String,
    /// Limit installed for the new tool.
    pub new_life_setting: u32,
    /// Operator name.
    pub operator: String,
}

impl ToolChangeRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let start: String = row.get(2)?;
        let end: String = row.get(3)?;
        Ok(Self {
            bank: row.get(0)?,
            tool_id: row.get(1)?,
            start_time: parse_timestamp(&start).unwrap_or_default(),
            end_time: parse_timestamp(&end).unwrap_or_default(),
            change_reason: row.get(4)?,
            new_life_setting: row.get(5)?,
            operator: row.get(6)?,
        })
    }
}

/// Persistent tool-change history plus remembered reasons and operators.
#[derive(Debug, Clone)]
pub struct ToolHistoryStore {
    storage: Storage,
}

impl ToolHistoryStore {
    /// Creates a store on shared storage.
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Appends a record and remembers its reason and operator.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the insert fails.
    pub fn record(&self, record: &ToolChangeRecord) -> Result<()> {
        self.storage.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_history \
                 (bank, tool_id, start_time, end_time, change_reason, new_life_setting, operator) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.bank,
                    record.tool_id,
                    format_timestamp(record.start_time),
                    format_timestamp(record.end_time),
                    record.change_reason,
                    record.new_life_setting,
                    record.operator,
                ],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO change_reason_history (reason) VALUES (?1)",
                params![record.change_reason],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO operator_history (operator) VALUES (?1)",
                params![record.operator],
            )?;
            Ok(())
        })
    }

    /// Returns history, newest change first, optionally filtered.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn query(&self, bank: Option<&str>, tool_id: Option<&str>) -> Result<Vec<ToolChangeRecord>> {
        let mut sql = String::from(
            "SELECT bank, tool_id, start_time, end_time, change_reason, new_life_setting, operator \
             FROM tool_history WHERE 1 = 1",
        );
        let mut args: Vec<&str> = Vec::new();
        if let Some(bank) = bank {
            args.push(bank);
            sql.push_str(&format!(" AND bank = ?{}", args.len()));
        }
        if let Some(tool_id) = tool_id {
            args.push(tool_id);
            sql.push_str(&format!(" AND tool_id = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY end_time DESC, id DESC");
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), ToolChangeRecord::from_row)?;
            rows.collect()
        })
    }

    /// Deletes every history record. Remembered reasons and operators are kept.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the delete fails.
    pub fn clear(&self) -> Result<usize> {
        let removed = self
            .storage
            .with_conn(|conn| conn.execute("DELETE FROM tool_history", []))?;
        info!(removed, "cleared tool history");
        Ok(removed)
    }

    /// Returns remembered change reasons, sorted.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn reasons(&self) -> Result<Vec<String>> {
        self.strings("SELECT reason FROM change_reason_history ORDER BY reason")
    }

    /// Returns remembered operator names, sorted.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the query fails.
    pub fn operators(&self) -> Result<Vec<String>> {
        self.strings("SELECT operator FROM operator_history ORDER BY operator")
    }

    fn strings(&self, sql: &str) -> Result<Vec<String>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }
}

/// All slots sharing one trigger and one attention bit.
pub struct ToolBank {
    config: ToolBankConfig,
    counters: Vec<ToolLifeCounter>,
    writer: Arc<dyn BitWriter>,
    history: Option<ToolHistoryStore>,
    clock: Arc<dyn Clock>,
    events: EventSender,
}

impl ToolBank {
    /// Creates a bank with every slot disabled.
    pub fn new(
        config: ToolBankConfig,
        writer: Arc<dyn BitWriter>,
        history: Option<ToolHistoryStore>,
        events: EventSender,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();
        let counters = (0..config.slots)
            .map(|i| ToolLifeCounter::new(format!("T{}", i), now))
            .collect();
        Self {
            config,
            counters,
            writer,
            history,
            clock,
            events,
        }
    }

    /// Replaces the clock used for history timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        for counter in &mut self.counters {
            counter.counting_since = now;
        }
        self.clock = clock;
        self
    }

    /// Returns the bank name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the state of every slot.
    pub fn slots(&self) -> Vec<ToolSlot> {
        self.counters.iter().map(ToolLifeCounter::slot).collect()
    }

    /// Returns the state of one slot.
    pub fn slot(&self, tool_id: &str) -> Option<ToolSlot> {
        self.counters
            .iter()
            .find(|c| c.id == tool_id)
            .map(ToolLifeCounter::slot)
    }

    /// Returns the ids of slots waiting for the operator.
    pub fn pending(&self) -> Vec<String> {
        self.counters
            .iter()
            .filter(|c| c.awaiting_ack)
            .map(|c| c.id.clone())
            .collect()
    }

    fn counter_mut(&mut self, tool_id: &str) -> Result<&mut ToolLifeCounter> {
        self.counters
            .iter_mut()
            .find(|c| c.id == tool_id)
            .ok_or_else(|| PlcError::invalid_parameter("tool_id", format!("unknown tool '{}'", tool_id)))
    }

    /// Feeds one trigger value to every slot.
    pub fn process_trigger(&mut self, trigger: bool) {
        let mut expired = Vec::new();
        for counter in &mut self.counters {
            match counter.observe(trigger) {
                ToolOutcome::Expired(count) => expired.push((counter.id.clone(), count, counter.life_limit)),
                ToolOutcome::Counted(count) => {
                    debug!(bank = %self.config.name, tool = %counter.id, count, "tool use counted")
                }
                ToolOutcome::Idle => {}
            }
        }
        if expired.is_empty() {
            return;
        }
        for (tool, count, limit) in expired {
            warn!(bank = %self.config.name, tool = %tool, count, limit, "tool life reached");
            self.events.send(Event::ToolExpired {
                bank: self.config.name.clone(),
                tool,
                count,
                limit,
            });
        }
        if let Err(e) = self.write_attention(true) {
            warn!(bank = %self.config.name, error = %e, "failed to set tool attention bit");
        }
    }

    fn write_attention(&self, value: bool) -> Result<()> {
        let (offset, bit) = self.config.attention.bit_address()?;
        self.writer
            .set_bit(offset, bit, value)
            .inspect_err(|e| {
                self.events.send(Event::WriteFailed {
                    offset,
                    bit,
                    error: e.to_string(),
                })
            })
    }

    /// Completes a tool change.
    ///
    /// The slot's count restarts at 0 with `new_limit` and a history record is
    /// written. The attention bit stays set while other slots of the bank still
    /// wait for the operator. A history write failure is reported; the change
    /// still takes effect.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for an unknown tool and the write
    /// error if the attention bit cannot be cleared. Slot state is not rolled
    /// back on a write error.
    pub fn acknowledge(
        &mut self,
        tool_id: &str,
        new_limit: u32,
        reason: &str,
        operator: &str,
    ) -> Result<ToolChangeRecord> {
        let now = self.clock.now();
        let bank = self.config.name.clone();
        let counter = self.counter_mut(tool_id)?;
        let started = counter.acknowledge(new_limit, now);
        let record = ToolChangeRecord {
            bank,
            tool_id: tool_id.to_string(),
            start_time: started,
            end_time: now,
            change_reason: reason.to_string(),
            new_life_setting: new_limit,
            operator: operator.to_string(),
        };
        if let Some(history) = &self.history {
            if let Err(e) = history.record(&record) {
                warn!(bank = %record.bank, tool = tool_id, error = %e, "failed to record tool change");
                self.events.send(Event::Error {
                    message: format!("failed to record tool change for {}: {}", tool_id, e),
                });
            }
        }
        info!(bank = %record.bank, tool = tool_id, new_limit, operator, "tool change acknowledged");
        self.refresh_attention()?;
        Ok(record)
    }

    /// Declines a tool change: the count stays at the limit. The attention bit
    /// is cleared once no other slot is pending.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for an unknown tool and the write
    /// error if the attention bit cannot be written.
    pub fn decline(&mut self, tool_id: &str) -> Result<()> {
        self.counter_mut(tool_id)?.decline();
        info!(bank = %self.config.name, tool = tool_id, "tool change declined, count frozen");
        self.refresh_attention()
    }

    /// Writes the attention bit from the pending slots.
    fn refresh_attention(&self) -> Result<()> {
        let pending = self.pending();
        if !pending.is_empty() {
            debug!(bank = %self.config.name, ?pending, "tool changes still pending");
        }
        self.write_attention(!pending.is_empty())
    }

    /// Installs a new life limit for one slot and restarts its count.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for an unknown tool.
    pub fn set_life_limit(&mut self, tool_id: &str, limit: u32) -> Result<()> {
        let now = self.clock.now();
        self.counter_mut(tool_id)?.set_life_limit(limit, now);
        info!(bank = %self.config.name, tool = tool_id, limit, "tool life limit set");
        Ok(())
    }

    /// Restarts every slot's count.
    pub fn reset_all_counts(&mut self) {
        let now = self.clock.now();
        for counter in &mut self.counters {
            counter.reset_count(now);
        }
        info!(bank = %self.config.name, "all tool counts reset");
    }
}

impl SnapshotConsumer for ToolBank {
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        if let Some(trigger) = snapshot.bit(&self.config.trigger) {
            self.process_trigger(trigger);
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

impl std::fmt::Debug for ToolBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBank")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::channel;
    use crate::link::DeviceLink;
    use crate::simulator::SimulatedPlc;
    use chrono::{Duration as ChronoDuration, NaiveDate};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap()
    }

    fn pulse(counter: &mut ToolLifeCounter) -> ToolOutcome {
        let outcome = counter.observe(true);
        counter.observe(false);
        outcome
    }

    #[test]
    fn test_limit_three_expires_once() {
        let mut counter = ToolLifeCounter::new("T0", start());
        counter.set_life_limit(3, start());
        assert_eq!(pulse(&mut counter), ToolOutcome::Counted(1));
        assert_eq!(pulse(&mut counter), ToolOutcome::Counted(2));
        assert_eq!(pulse(&mut counter), ToolOutcome::Expired(3));
        assert_eq!(pulse(&mut counter), ToolOutcome::Idle);
        assert_eq!(counter.slot().count, 3);
        assert!(counter.slot().awaiting_ack);
    }

    #[test]
    fn test_held_signal_counts_once() {
        let mut counter = ToolLifeCounter::new("T0", start());
        counter.set_life_limit(10, start());
        for _ in 0..5 {
            counter.observe(true);
        }
        assert_eq!(counter.slot().count, 1);
    }

    #[test]
    fn test_disabled_slot_tracks_edges() {
        let mut counter = ToolLifeCounter::new("T5", start());
        assert_eq!(counter.observe(true), ToolOutcome::Idle);
        counter.set_life_limit(2, start());
        // signal still high: no edge
        assert_eq!(counter.observe(true), ToolOutcome::Idle);
        assert_eq!(counter.slot().count, 0);
    }

    #[test]
    fn test_decline_freezes_until_limit_change() {
        let mut counter = ToolLifeCounter::new("T1", start());
        counter.set_life_limit(1, start());
        assert_eq!(pulse(&mut counter), ToolOutcome::Expired(1));
        counter.decline();
        assert_eq!(pulse(&mut counter), ToolOutcome::Idle);
        assert_eq!(counter.slot().count, 1);
        assert!(!counter.slot().awaiting_ack);

        counter.set_life_limit(2, start());
        assert_eq!(pulse(&mut counter), ToolOutcome::Counted(1));
    }

    #[test]
    fn test_acknowledge_returns_start() {
        let mut counter = ToolLifeCounter::new("T1", start());
        counter.set_life_limit(1, start());
        pulse(&mut counter);
        let later = start() + ChronoDuration::hours(2);
        assert_eq!(counter.acknowledge(5, later), start());
        let slot = counter.slot();
        assert_eq!((slot.count, slot.life_limit), (0, 5));
        assert_eq!(slot.counting_since, later);
        assert!(slot.active);
    }

    fn bank(plc: &SimulatedPlc, clock: &ManualClock) -> (ToolBank, ToolHistoryStore) {
        let link = Arc::new(DeviceLink::new(plc.clone()));
        link.connect().unwrap();
        let history = ToolHistoryStore::new(Storage::in_memory().unwrap());
        let bank = ToolBank::new(
            ToolBankConfig::default(),
            link,
            Some(history.clone()),
            EventSender::discard(),
        )
        .with_clock(Arc::new(clock.clone()));
        (bank, history)
    }

    #[test]
    fn test_bank_shared_trigger_and_attention() {
        let plc = SimulatedPlc::new(2048);
        let clock = ManualClock::at(start());
        let (mut bank, _) = bank(&plc, &clock);
        bank.set_life_limit("T0", 2).unwrap();
        bank.set_life_limit("T1", 3).unwrap();

        for _ in 0..2 {
            bank.process_trigger(true);
            bank.process_trigger(false);
        }
        assert!(plc.bit(750, 7));
        assert_eq!(bank.pending(), vec!["T0".to_string()]);
        assert_eq!(bank.slot("T1").unwrap().count, 2);
        assert_eq!(bank.slot("T2").unwrap().count, 0);
    }

    #[test]
    fn test_bank_acknowledge_writes_history() {
        let plc = SimulatedPlc::new(2048);
        let clock = ManualClock::at(start());
        let (mut bank, history) = bank(&plc, &clock);
        bank.set_life_limit("T3", 1).unwrap();
        bank.process_trigger(true);
        assert!(plc.bit(750, 7));

        clock.advance(ChronoDuration::minutes(30));
        let record = bank.acknowledge("T3", 100, "worn", "li").unwrap();
        assert_eq!(record.start_time, start());
        assert_eq!(record.end_time, start() + ChronoDuration::minutes(30));
        assert!(!plc.bit(750, 7));
        assert!(bank.pending().is_empty());

        let rows = history.query(Some("machine_a"), Some("T3")).unwrap();
        assert_eq!(rows, vec![record]);
        assert_eq!(history.reasons().unwrap(), vec!["worn".to_string()]);
        assert_eq!(history.operators().unwrap(), vec!["li".to_string()]);
    }

    #[test]
    fn test_bank_decline_clears_attention() {
        let plc = SimulatedPlc::new(2048);
        let clock = ManualClock::at(start());
        let (mut bank, history) = bank(&plc, &clock);
        bank.set_life_limit("T0", 1).unwrap();
        bank.process_trigger(true);
        bank.decline("T0").unwrap();
        assert!(!plc.bit(750, 7));
        assert_eq!(bank.slot("T0").unwrap().count, 1);
        assert!(history.query(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_write_failure_keeps_state() {
        let plc = SimulatedPlc::new(2048);
        let clock = ManualClock::at(start());
        let link = Arc::new(DeviceLink::new(plc.clone()));
        link.connect().unwrap();
        let (tx, rx) = channel(16);
        let mut bank = ToolBank::new(ToolBankConfig::default(), link, None, tx)
            .with_clock(Arc::new(clock.clone()));
        bank.set_life_limit("T0", 1).unwrap();
        bank.process_trigger(true);

        plc.fail_next_writes(1);
        assert!(bank.acknowledge("T0", 4, "worn", "li").is_err());
        assert_eq!(bank.slot("T0").unwrap().life_limit, 4);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, Event::WriteFailed { offset: 750, bit: 7, .. })));
    }

    #[test]
    fn test_unknown_tool_and_reset_all() {
        let plc = SimulatedPlc::new(2048);
        let clock = ManualClock::at(start());
        let (mut bank, _) = bank(&plc, &clock);
        assert!(bank.set_life_limit("T99", 1).is_err());
        bank.set_life_limit("T0", 5).unwrap();
        bank.process_trigger(true);
        bank.reset_all_counts();
        assert_eq!(bank.slot("T0").unwrap().count, 0);
        assert_eq!(bank.slots().len(), DEFAULT_TOOL_SLOTS);
    }

    #[test]
    fn test_history_clear_and_order() {
        let history = ToolHistoryStore::new(Storage::in_memory().unwrap());
        for (i, tool) in ["T0", "T1"].iter().enumerate() {
            history
                .record(&ToolChangeRecord {
                    bank: "machine_b".into(),
                    tool_id: tool.to_string(),
                    start_time: start(),
                    end_time: start() + ChronoDuration::hours(i as i64 + 1),
                    change_reason: "broken".into(),
                    new_life_setting: 10,
                    operator: "wang".into(),
                })
                .unwrap();
        }
        let rows = history.query(Some("machine_b"), None).unwrap();
        assert_eq!(rows[0].tool_id, "T1");
        assert_eq!(history.reasons().unwrap().len(), 1);
        assert_eq!(history.clear().unwrap(), 2);
        assert!(history.query(None, None).unwrap().is_empty());
        assert_eq!(history.operators().unwrap(), vec!["wang".to_string()]);
    }

    #[test]
    fn test_attention_held_while_slots_pending() {
        let plc = SimulatedPlc::new(2048);
        let clock = ManualClock::at(start());
        let (mut bank, _) = bank(&plc, &clock);
        bank.set_life_limit("T0", 1).unwrap();
        bank.set_life_limit("T1", 1).unwrap();
        bank.set_life_limit("T2", 1).unwrap();
        bank.process_trigger(true);
        assert_eq!(bank.pending().len(), 3);
        assert!(plc.bit(750, 7));

        bank.acknowledge("T0", 10, "worn", "li").unwrap();
        assert_eq!(bank.pending(), vec!["T1".to_string(), "T2".to_string()]);
        assert!(plc.bit(750, 7));

        bank.decline("T1").unwrap();
        assert!(plc.bit(750, 7));

        bank.acknowledge("T2", 10, "worn", "li").unwrap();
        assert!(bank.pending().is_empty());
        assert!(!plc.bit(750, 7));
    }

    #[test]
    fn test_history_failure_still_changes_tool() {
        let plc = SimulatedPlc::new(2048);
        let clock = ManualClock::at(start());
        let link = Arc::new(DeviceLink::new(plc.clone()));
        link.connect().unwrap();
        let storage = Storage::in_memory().unwrap();
        let (tx, rx) = channel(16);
        let mut bank = ToolBank::new(
            ToolBankConfig::default(),
            link,
            Some(ToolHistoryStore::new(storage.clone())),
            tx,
        )
        .with_clock(Arc::new(clock.clone()));
        storage
            .with_conn(|conn| conn.execute_batch("DROP TABLE tool_history"))
            .unwrap();

        bank.set_life_limit("T4", 1).unwrap();
        bank.process_trigger(true);
        let record = bank.acknowledge("T4", 8, "chipped", "zhao").unwrap();
        assert_eq!(record.new_life_setting, 8);
        let slot = bank.slot("T4").unwrap();
        assert_eq!((slot.count, slot.life_limit, slot.active), (0, 8, true));
        assert!(!plc.bit(750, 7));
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, Event::Error { message } if message.contains("T4"))));
    }

    #[test]
    fn test_byte_attention_is_rejected_on_write() {
        let plc = SimulatedPlc::new(2048);
        let link = Arc::new(DeviceLink::new(plc.clone()));
        link.connect().unwrap();
        let config = ToolBankConfig {
            attention: SignalId::byte(1011),
            ..ToolBankConfig::default()
        };
        let mut bank = ToolBank::new(config, link, None, EventSender::discard());
        bank.set_life_limit("T0", 1).unwrap();
        bank.process_trigger(true);
        bank.process_trigger(false);
        assert_eq!(plc.peek(1011), 0);
        assert!(matches!(
            bank.decline("T0"),
            Err(PlcError::InvalidAddressing { .. })
        ));
    }
}
