//! Typed events emitted by the engine and its consumers.
//!
//! Events travel over a bounded channel. Senders never block: when the
//! receiver falls behind, new events are dropped and counted. Status and error
//! messages are also written to the log, so nothing is lost silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::engine::EngineState;
use crate::snapshot::Snapshot;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something a subscriber may want to react to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Human-readable status message.
    Status {
        /// Message text.
        message: String,
    },
    /// Human-readable error message.
    Error {
        /// Message text.
        message: String,
    },
    /// The engine moved to a new state.
    StateChanged {
        /// New state.
        state: EngineState,
    },
    /// A complete poll cycle (only when snapshot publishing is enabled).
    Snapshot {
        /// The cycle's values.
        snapshot: Snapshot,
    },
    /// One cycle's reads failed.
    ReadFailed {
        /// Cycle number.
        cycle: u64,
        /// Failures in a row, including this one.
        consecutive: u32,
        /// Error text.
        error: String,
    },
    /// Reads have failed several cycles in a row.
    ReadFailuresEscalated {
        /// Failures in a row.
        consecutive: u32,
    },
    /// Reads succeeded again after failures.
    ReadsRecovered {
        /// Failures before the successful cycle.
        after: u32,
    },
    /// The engine stopped after its last cycle.
    Stopped {
        /// Cycles completed.
        cycles: u64,
    },
    /// A tool slot reached its life limit.
    ToolExpired {
        /// Tool bank name.
        bank: String,
        /// Tool slot id.
        tool: String,
        /// Wear count.
        count: u32,
        /// Life limit.
        limit: u32,
    },
    /// A tray reached its capacity.
    TrayFull {
        /// Tray id.
        tray: String,
        /// Fill count.
        count: u32,
    },
    /// Production tally incremented.
    ProductionCounted {
        /// Date the piece was counted on.
        date: NaiveDate,
        /// Tally for that date after the increment.
        count: u64,
    },
    /// Calendar day rolled over.
    ProductionDayChanged {
        /// Previous date.
        from: NaiveDate,
        /// New date.
        to: NaiveDate,
    },
    /// An alarm field became active.
    AlarmRaised {
        /// Alarm name.
        name: String,
        /// Raw field value.
        value: i64,
    },
    /// An alarm field returned to zero.
    AlarmCleared {
        /// Alarm name.
        name: String,
    },
    /// A write-back command failed.
    WriteFailed {
        /// Byte offset.
        offset: u32,
        /// Bit index.
        bit: u8,
        /// Error text.
        error: String,
    },
    /// The PLC entered or left manual mode.
    ManualModeChanged {
        /// Whether manual mode is active.
        manual: bool,
    },
}

/// Creates a bounded event channel.
///
/// # Example
///
/// ```
/// use plcwatch::event::{channel, Event};
///
/// let (tx, rx) = channel(1);
/// tx.status("connected");
/// tx.status("this one is dropped");
/// assert!(matches!(rx.try_recv(), Ok(Event::Status { .. })));
/// assert_eq!(tx.dropped(), 1);
/// ```
pub fn channel(capacity: usize) -> (EventSender, Receiver<Event>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    (
        EventSender {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Non-blocking handle for emitting events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Option<SyncSender<Event>>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// A sender with no receiver. Events are only logged.
    pub fn discard() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emits an event without blocking.
    pub fn send(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped <= 10 || dropped % 1000 == 0 {
                    warn!(dropped, ?event, "event channel full, dropping event");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("event receiver gone");
            }
        }
    }

    /// Logs and emits a status message.
    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.send(Event::Status { message });
    }

    /// Logs and emits an error message.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{}", message);
        self.send(Event::Error { message });
    }

    /// Returns how many events were dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::discard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (tx, rx) = channel(8);
        tx.status("a");
        tx.error("b");
        tx.send(Event::Stopped { cycles: 3 });
        let events: Vec<Event> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Event::Status { message } if message == "a"));
        assert!(matches!(&events[1], Event::Error { message } if message == "b"));
        assert!(matches!(events[2], Event::Stopped { cycles: 3 }));
    }

    #[test]
    fn test_full_channel_never_blocks() {
        let (tx, _rx) = channel(2);
        for _ in 0..10 {
            tx.send(Event::ReadsRecovered { after: 1 });
        }
        assert_eq!(tx.dropped(), 8);
        assert_eq!(tx.clone().dropped(), 8);
    }

    #[test]
    fn test_disconnected_receiver() {
        let (tx, rx) = channel(2);
        drop(rx);
        tx.status("nobody listens");
        assert_eq!(tx.dropped(), 0);
        EventSender::discard().status("ignored");
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_value(Event::TrayFull {
            tray: "tray1".into(),
            count: 20,
        })
        .unwrap();
        assert_eq!(json["type"], "tray_full");
        assert_eq!(json["tray"], "tray1");

        let json = serde_json::to_value(Event::ProductionDayChanged {
            from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            to: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        })
        .unwrap();
        assert_eq!(json["to"], "2024-01-02");
    }
}
