//! Tray fill counting.
//!
//! A tray counts rising edges of its trigger signal while active. It starts
//! inactive and becomes active when the operator sets a max count above
//! zero. When the count reaches the max, the tray deactivates itself and the
//! bank raises its "full" output bit until the operator acknowledges.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::address::SignalId;
use crate::edge::EdgeTracker;
use crate::error::{PlcError, Result};
use crate::event::{Event, EventSender};
use crate::link::BitWriter;
use crate::snapshot::{Snapshot, SnapshotConsumer};

/// Observable state of one tray.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tray {
    /// Tray id.
    pub id: String,
    /// Signal whose rising edge adds one piece.
    pub trigger: SignalId,
    /// Capacity; 0 disables the tray.
    pub max_count: u32,
    /// Pieces counted.
    pub count: u32,
    /// Whether edges are counted.
    pub active: bool,
    /// Whether the tray deactivated itself by filling up.
    pub full: bool,
}

/// Result of feeding one trigger value to a tray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayOutcome {
    /// Nothing counted.
    Idle,
    /// Count incremented to the given value.
    Counted(u32),
    /// Count reached capacity; the tray is now inactive.
    Full(u32),
}

/// Fill counter of one tray.
///
/// # Example
///
/// ```
/// use plcwatch::tray::{TrayCounter, TrayOutcome};
/// use plcwatch::SignalId;
///
/// let mut tray = TrayCounter::new("tray1", "V750.0".parse::<SignalId>().unwrap());
/// assert_eq!(tray.observe(true), TrayOutcome::Idle);
/// tray.set_max_count(1);
/// tray.observe(false);
/// assert_eq!(tray.observe(true), TrayOutcome::Full(1));
/// assert!(!tray.tray().active);
/// ```
#[derive(Debug, Clone)]
pub struct TrayCounter {
    tray: Tray,
    edge: EdgeTracker,
}

impl TrayCounter {
    /// Creates an inactive tray.
    pub fn new(id: impl Into<String>, trigger: SignalId) -> Self {
        Self {
            tray: Tray {
                id: id.into(),
                trigger,
                max_count: 0,
                count: 0,
                active: false,
                full: false,
            },
            edge: EdgeTracker::new(),
        }
    }

    /// Returns the tray state.
    pub fn tray(&self) -> &Tray {
        &self.tray
    }

    /// Feeds the current trigger value.
    ///
    /// Inactive trays only update their edge tracker.
    pub fn observe(&mut self, trigger: bool) -> TrayOutcome {
        let edge = self.edge.observe(trigger);
        if !self.tray.active || !edge.is_rising() {
            return TrayOutcome::Idle;
        }
        self.tray.count += 1;
        if self.tray.count >= self.tray.max_count {
            self.tray.active = false;
            self.tray.full = true;
            return TrayOutcome::Full(self.tray.count);
        }
        TrayOutcome::Counted(self.tray.count)
    }

    /// Sets the capacity. A value above zero activates the tray; zero
    /// deactivates it. The count is unchanged.
    pub fn set_max_count(&mut self, max_count: u32) {
        self.tray.max_count = max_count;
        self.tray.active = max_count > 0;
        self.tray.full = false;
    }

    /// Sets the count to zero. A tray that deactivated by filling up becomes
    /// active again if its capacity is still above zero.
    pub fn reset(&mut self) {
        self.tray.count = 0;
        if self.tray.full && self.tray.max_count > 0 {
            self.tray.active = true;
        }
        self.tray.full = false;
    }
}

/// Configuration of one tray.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrayConfig {
    /// Tray id.
    pub id: String,
    /// Trigger signal.
    pub trigger: SignalId,
}

/// Configuration of all trays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrayBankConfig {
    /// Trays in display order.
    pub trays: Vec<TrayConfig>,
    /// Output bit raised when any tray fills up.
    pub full_output: Option<SignalId>,
}

impl Default for TrayBankConfig {
    fn default() -> Self {
        let trigger = SignalId::Bit {
            offset: 750,
            bit: 0,
        };
        Self {
            trays: vec![
                TrayConfig {
                    id: "tray1".to_string(),
                    trigger,
                },
                TrayConfig {
                    id: "tray2".to_string(),
                    trigger,
                },
            ],
            full_output: Some(SignalId::Bit {
                offset: 750,
                bit: 7,
            }),
        }
    }
}

/// All trays plus the shared "full" output.
pub struct TrayBank {
    trays: Vec<TrayCounter>,
    full_output: Option<SignalId>,
    writer: Arc<dyn BitWriter>,
    events: EventSender,
}

impl TrayBank {
    /// Creates a bank of inactive trays.
    pub fn new(config: TrayBankConfig, writer: Arc<dyn BitWriter>, events: EventSender) -> Self {
        Self {
            trays: config
                .trays
                .into_iter()
                .map(|t| TrayCounter::new(t.id, t.trigger))
                .collect(),
            full_output: config.full_output,
            writer,
            events,
        }
    }

    /// Returns every tray.
    pub fn trays(&self) -> Vec<Tray> {
        self.trays.iter().map(|t| t.tray().clone()).collect()
    }

    /// Returns one tray.
    pub fn tray(&self, id: &str) -> Option<Tray> {
        self.trays
            .iter()
            .find(|t| t.tray.id == id)
            .map(|t| t.tray().clone())
    }

    fn counter_mut(&mut self, id: &str) -> Result<&mut TrayCounter> {
        self.trays
            .iter_mut()
            .find(|t| t.tray.id == id)
            .ok_or_else(|| PlcError::invalid_parameter("tray", format!("unknown tray '{}'", id)))
    }

    /// Sets a tray's capacity and clears the full output.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for an unknown tray and the write
    /// error if the output cannot be cleared.
    pub fn set_max_count(&mut self, id: &str, max_count: u32) -> Result<()> {
        let counter = self.counter_mut(id)?;
        counter.set_max_count(max_count);
        if max_count > 0 {
            info!(tray = id, max_count, "tray enabled");
        } else {
            info!(tray = id, "tray disabled");
        }
        self.write_full(false)
    }

    /// Resets a tray's count.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for an unknown tray.
    pub fn reset(&mut self, id: &str) -> Result<()> {
        let counter = self.counter_mut(id)?;
        counter.reset();
        info!(tray = id, active = counter.tray.active, "tray count reset");
        Ok(())
    }

    /// Clears the full output after the operator saw the notice.
    ///
    /// # Errors
    ///
    /// Returns the write error if the output cannot be cleared.
    pub fn acknowledge_full(&self) -> Result<()> {
        self.write_full(false)
    }

    fn write_full(&self, value: bool) -> Result<()> {
        let Some(output) = self.full_output else {
            return Ok(());
        };
        let (offset, bit) = output.bit_address()?;
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
}

impl SnapshotConsumer for TrayBank {
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        let mut filled = false;
        for counter in &mut self.trays {
            let Some(trigger) = snapshot.bit(&counter.tray.trigger) else {
                continue;
            };
            match counter.observe(trigger) {
                TrayOutcome::Full(count) => {
                    warn!(tray = %counter.tray.id, count, "tray full");
                    self.events.send(Event::TrayFull {
                        tray: counter.tray.id.clone(),
                        count,
                    });
                    filled = true;
                }
                TrayOutcome::Counted(count) => {
                    debug!(tray = %counter.tray.id, count, max = counter.tray.max_count, "tray piece counted")
                }
                TrayOutcome::Idle => {}
            }
        }
        if filled {
            if let Err(e) = self.write_full(true) {
                warn!(error = %e, "failed to set tray full output");
            }
        }
    }

    fn name(&self) -> &str {
        "trays"
    }
}

impl std::fmt::Debug for TrayBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrayBank")
            .field("trays", &self.trays())
            .field("full_output", &self.full_output)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::DeviceLink;
    use crate::simulator::SimulatedPlc;
    use crate::snapshot::SignalValue;
    use std::collections::BTreeMap;

    fn trigger() -> SignalId {
        SignalId::bit(750, 0).unwrap()
    }

    fn pulse(tray: &mut TrayCounter) -> TrayOutcome {
        let outcome = tray.observe(true);
        tray.observe(false);
        outcome
    }

    #[test]
    fn test_max_two_fills_once() {
        let mut tray = TrayCounter::new("tray1", trigger());
        assert!(!tray.tray().active);
        tray.set_max_count(2);
        assert!(tray.tray().active);

        assert_eq!(pulse(&mut tray), TrayOutcome::Counted(1));
        assert_eq!(pulse(&mut tray), TrayOutcome::Full(2));
        assert!(!tray.tray().active);
        assert_eq!(pulse(&mut tray), TrayOutcome::Idle);
        assert_eq!(tray.tray().count, 2);

        tray.reset();
        assert!(tray.tray().active);
        assert_eq!(pulse(&mut tray), TrayOutcome::Counted(1));
    }

    #[test]
    fn test_inactive_tray_tracks_edges() {
        let mut tray = TrayCounter::new("tray1", trigger());
        tray.observe(true);
        tray.set_max_count(5);
        // still high, so no edge on activation
        assert_eq!(tray.observe(true), TrayOutcome::Idle);
        assert_eq!(tray.tray().count, 0);
    }

    #[test]
    fn test_set_max_zero_deactivates_and_keeps_count() {
        let mut tray = TrayCounter::new("tray1", trigger());
        tray.set_max_count(10);
        pulse(&mut tray);
        tray.set_max_count(0);
        assert!(!tray.tray().active);
        assert_eq!(tray.tray().count, 1);
        tray.reset();
        assert!(!tray.tray().active);
    }

    fn snapshot(value: bool) -> Snapshot {
        let mut values = BTreeMap::new();
        values.insert(trigger(), SignalValue::Bool(value));
        Snapshot::new(1, Default::default(), values)
    }

    #[test]
    fn test_bank_full_output() {
        let plc = SimulatedPlc::new(2048);
        let link = Arc::new(DeviceLink::new(plc.clone()));
        link.connect().unwrap();
        let (tx, rx) = crate::event::channel(16);
        let mut bank = TrayBank::new(TrayBankConfig::default(), link, tx);

        bank.set_max_count("tray1", 1).unwrap();
        bank.set_max_count("tray2", 3).unwrap();
        bank.on_snapshot(&snapshot(true));
        assert!(plc.bit(750, 7));
        assert!(bank.tray("tray1").unwrap().full);
        assert_eq!(bank.tray("tray2").unwrap().count, 1);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, Event::TrayFull { ref tray, count: 1 } if tray == "tray1")));

        bank.acknowledge_full().unwrap();
        assert!(!plc.bit(750, 7));

        bank.reset("tray1").unwrap();
        assert!(bank.tray("tray1").unwrap().active);
        assert!(bank.reset("tray9").is_err());
    }
}
