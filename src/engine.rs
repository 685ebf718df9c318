//! Cyclic polling engine.
//!
//! The engine owns the read plan and drives one dedicated thread:
//!
//! ```text
//! Idle -> Connecting -> Polling -> Idle
//!            |                      ^
//!            +---- connect error ---+
//! ```
//!
//! Each cycle reads every span of the plan through the [`DeviceLink`], decodes
//! all signals into one [`Snapshot`] and hands it to each consumer in
//! registration order, inline on the polling thread. A snapshot is only
//! dispatched once every span has been read and decoded, so consumers never
//! see a partial cycle.
//!
//! A failed cycle (read error, timeout, short buffer, lost connection) is
//! reported, followed by a backoff, and polling continues. After
//! `escalation_threshold` failures in a row an escalation event is emitted
//! once. Stopping is cooperative: the stop flag is checked between cycles and
//! the link is disconnected after the in-flight cycle completes.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use plcwatch::{DeviceLink, EngineConfig, FnConsumer, PollingEngine, RegisterMap, SimulatedPlc};
//! use plcwatch::event::EventSender;
//!
//! let plc = SimulatedPlc::new(2048);
//! let link = Arc::new(DeviceLink::new(plc.clone()));
//! let config = EngineConfig {
//!     interval: Duration::from_millis(10),
//!     ..EngineConfig::default()
//! };
//! let mut engine = PollingEngine::new(link, &RegisterMap::default(), config, EventSender::discard());
//! engine.add_consumer(FnConsumer::new("print", |s: &plcwatch::Snapshot| {
//!     let _ = s.len();
//! }));
//!
//! let handle = engine.start().unwrap();
//! std::thread::sleep(Duration::from_millis(50));
//! handle.stop();
//! let stats = handle.join().unwrap();
//! assert!(stats.cycles > 0);
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::address::SignalId;
use crate::clock::{Clock, SystemClock};
use crate::codec::{decode_byte, decode_float_slice, get_bit, FLOAT_WIDTH};
use crate::error::{PlcError, Result};
use crate::event::{Event, EventSender};
use crate::link::DeviceLink;
use crate::register_map::{ReadPlan, ReadSpan, RegisterMap};
use crate::snapshot::{SignalValue, Snapshot, SnapshotConsumer};

/// Longest single sleep between stop-flag checks.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(20);

/// Timing and failure policy of the polling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target cycle period.
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Pause after a failed cycle.
    #[serde(with = "millis")]
    pub failure_backoff: Duration,
    /// Consecutive failures that trigger an escalation event.
    pub escalation_threshold: u32,
    /// Whether every snapshot is also sent on the event channel.
    pub publish_snapshots: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            failure_backoff: Duration::from_millis(2000),
            escalation_threshold: 3,
            publish_snapshots: false,
        }
    }
}

/// Serde helper storing durations as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Not running.
    Idle,
    /// Opening the connection.
    Connecting,
    /// Running cycles.
    Polling,
}

/// Counters describing the polling loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    /// Cycles attempted.
    pub cycles: u64,
    /// Cycles whose reads failed.
    pub failed_cycles: u64,
    /// Current run of failed cycles.
    pub consecutive_failures: u32,
    /// Cycles that took longer than the interval.
    pub overruns: u64,
    /// Duration of the last cycle.
    pub last_cycle: Duration,
    /// Longest cycle observed.
    pub max_cycle: Duration,
}

#[derive(Debug)]
struct Shared {
    running: AtomicBool,
    state: Mutex<EngineState>,
    stats: Mutex<CycleStats>,
}

/// Periodically reads the register map and fans snapshots out to consumers.
pub struct PollingEngine {
    link: Arc<DeviceLink>,
    plan: ReadPlan,
    config: EngineConfig,
    consumers: Vec<Box<dyn SnapshotConsumer>>,
    events: EventSender,
    clock: Arc<dyn Clock>,
    stats: CycleStats,
    shared: Arc<Shared>,
}

impl PollingEngine {
    /// Creates an idle engine for `map`.
    pub fn new(
        link: Arc<DeviceLink>,
        map: &RegisterMap,
        config: EngineConfig,
        events: EventSender,
    ) -> Self {
        let plan = map.read_plan();
        debug!(
            spans = plan.spans().len(),
            signals = plan.signal_count(),
            bytes = plan.byte_count(),
            "compiled read plan"
        );
        Self {
            link,
            plan,
            config,
            consumers: Vec::new(),
            events,
            clock: Arc::new(SystemClock),
            stats: CycleStats::default(),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                state: Mutex::new(EngineState::Idle),
                stats: Mutex::new(CycleStats::default()),
            }),
        }
    }

    /// Replaces the clock used to timestamp snapshots.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a consumer. Consumers run in registration order.
    pub fn add_consumer(&mut self, consumer: impl SnapshotConsumer + 'static) {
        debug!(consumer = consumer.name(), "registered snapshot consumer");
        self.consumers.push(Box::new(consumer));
    }

    /// Returns the compiled read plan.
    pub fn plan(&self) -> &ReadPlan {
        &self.plan
    }

    /// Returns the statistics so far.
    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Runs one cycle: read, decode, dispatch.
    ///
    /// A disconnected link is reconnected first. Failures update the failure
    /// counters and emit events; the error is also returned.
    ///
    /// # Errors
    ///
    /// Returns the first read, decode or reconnect error of the cycle.
    pub fn poll_once(&mut self) -> Result<Snapshot> {
        let started = Instant::now();
        self.stats.cycles += 1;
        let cycle = self.stats.cycles;

        let result = self.read_snapshot(cycle);
        match &result {
            Ok(snapshot) => {
                if self.stats.consecutive_failures > 0 {
                    let after = self.stats.consecutive_failures;
                    info!(after, "PLC reads recovered");
                    self.events.send(Event::ReadsRecovered { after });
                    self.stats.consecutive_failures = 0;
                }
                for consumer in self.consumers.iter_mut() {
                    consumer.on_snapshot(snapshot);
                }
                if self.config.publish_snapshots {
                    self.events.send(Event::Snapshot {
                        snapshot: snapshot.clone(),
                    });
                }
            }
            Err(e) => self.record_failure(cycle, e),
        }

        let elapsed = started.elapsed();
        self.stats.last_cycle = elapsed;
        self.stats.max_cycle = self.stats.max_cycle.max(elapsed);
        if elapsed > self.config.interval {
            self.stats.overruns += 1;
            if self.stats.overruns <= 10 || self.stats.overruns % 1000 == 0 {
                warn!(
                    "Cycle overrun #{}: cycle took {}ms (target {}ms)",
                    self.stats.overruns,
                    elapsed.as_millis(),
                    self.config.interval.as_millis()
                );
            }
        }
        if cycle % 1000 == 0 {
            debug!(
                "Poll loop: {} cycles, failed={}, max={}ms, overruns={}",
                cycle,
                self.stats.failed_cycles,
                self.stats.max_cycle.as_millis(),
                self.stats.overruns
            );
        }
        *self.shared.stats.lock() = self.stats;
        result
    }

    fn record_failure(&mut self, cycle: u64, e: &PlcError) {
        self.stats.failed_cycles += 1;
        self.stats.consecutive_failures += 1;
        let consecutive = self.stats.consecutive_failures;
        warn!(cycle, consecutive, error = %e, "poll cycle failed");
        self.events.send(Event::ReadFailed {
            cycle,
            consecutive,
            error: e.to_string(),
        });
        if consecutive == self.config.escalation_threshold {
            self.events.error(format!(
                "PLC reads failed {} cycles in a row: {}",
                consecutive, e
            ));
            self.events.send(Event::ReadFailuresEscalated { consecutive });
        }
    }

    fn read_snapshot(&mut self, cycle: u64) -> Result<Snapshot> {
        if !self.link.is_connected() {
            self.link.connect()?;
            self.events.status("PLC connection re-established");
        }
        let mut values = BTreeMap::new();
        for span in self.plan.spans() {
            let data = self.link.read_bytes(span.offset, span.len as usize)?;
            decode_span(span, &data, &mut values)?;
        }
        Ok(Snapshot::new(cycle, self.clock.now(), values))
    }

    fn set_state(&self, state: EngineState) {
        *self.shared.state.lock() = state;
        debug!(?state, "engine state changed");
        self.events.send(Event::StateChanged { state });
    }

    /// Starts the polling thread.
    ///
    /// The connection is opened on the polling thread. If it fails, the
    /// engine reports the error, returns to `Idle` and the thread ends; the
    /// error is returned from [`EngineHandle::join`].
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(mut self) -> Result<EngineHandle> {
        let shared = Arc::clone(&self.shared);
        shared.running.store(true, Ordering::SeqCst);
        let thread = thread::Builder::new()
            .name("plcwatch-poll".to_string())
            .spawn(move || self.run())?;
        Ok(EngineHandle {
            shared,
            thread: Some(thread),
        })
    }

    fn run(mut self) -> Result<CycleStats> {
        self.set_state(EngineState::Connecting);
        if let Err(e) = self.link.connect() {
            self.events.error(format!("PLC connection failed: {}", e));
            self.shared.running.store(false, Ordering::SeqCst);
            self.set_state(EngineState::Idle);
            return Err(e);
        }
        self.set_state(EngineState::Polling);
        info!(
            "Starting poll loop (interval={}ms, spans={})",
            self.config.interval.as_millis(),
            self.plan.spans().len()
        );

        while self.shared.running.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            let pause = match self.poll_once() {
                Ok(_) => self.config.interval.saturating_sub(cycle_start.elapsed()),
                Err(_) => self.config.failure_backoff,
            };
            self.sleep_while_running(pause);
        }

        self.link.disconnect();
        self.set_state(EngineState::Idle);
        info!(
            "Poll loop stopped after {} cycles (failed: {})",
            self.stats.cycles, self.stats.failed_cycles
        );
        self.events.send(Event::Stopped {
            cycles: self.stats.cycles,
        });
        Ok(self.stats)
    }

    fn sleep_while_running(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while self.shared.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
        }
    }
}

fn decode_span(
    span: &ReadSpan,
    data: &[u8],
    values: &mut BTreeMap<SignalId, SignalValue>,
) -> Result<()> {
    if data.len() != span.len as usize {
        return Err(PlcError::decode(span.offset, span.len as usize, data.len()));
    }
    for id in &span.signals {
        let start = (id.offset() - span.offset) as usize;
        let value = match *id {
            SignalId::Bit { bit, .. } => SignalValue::Bool(get_bit(data[start], bit)),
            SignalId::Byte { .. } => SignalValue::Byte(decode_byte(data[start])),
            SignalId::Float { offset } => {
                let raw = data.get(start..start + FLOAT_WIDTH).unwrap_or(&[]);
                SignalValue::Float(decode_float_slice(offset, raw)?)
            }
        };
        values.insert(*id, value);
    }
    Ok(())
}

impl std::fmt::Debug for PollingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingEngine")
            .field("spans", &self.plan.spans().len())
            .field("consumers", &self.consumers.len())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Controls a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<Result<CycleStats>>>,
}

impl EngineHandle {
    /// Requests a cooperative stop after the in-flight cycle.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Returns the engine's current state.
    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    /// Returns the latest statistics.
    pub fn stats(&self) -> CycleStats {
        *self.shared.stats.lock()
    }

    /// Returns whether the polling thread is still asked to run.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Waits for the polling thread to end.
    ///
    /// # Errors
    ///
    /// Returns the connection error if the engine never reached `Polling`.
    pub fn join(mut self) -> Result<CycleStats> {
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<CycleStats> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                error!("polling thread panicked");
                Err(PlcError::Io(std::io::Error::other("polling thread panicked")))
            }),
            None => Ok(self.stats()),
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
            let _ = self.join_thread();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel;
    use crate::simulator::SimulatedPlc;

    fn small_map() -> RegisterMap {
        RegisterMap {
            bit_groups: vec![600, 750],
            bytes: vec![1003],
            floats: vec![1200],
            ..RegisterMap::default()
        }
    }

    fn engine(plc: &SimulatedPlc, events: EventSender) -> PollingEngine {
        let link = Arc::new(DeviceLink::new(plc.clone()));
        link.connect().unwrap();
        let config = EngineConfig {
            interval: Duration::from_millis(5),
            failure_backoff: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        PollingEngine::new(link, &small_map(), config, events)
    }

    #[test]
    fn test_poll_once_decodes_all_kinds() {
        let plc = SimulatedPlc::new(2048);
        plc.set_bit(600, 0, true);
        plc.poke(1003, 1);
        plc.write_float(1200, -3.25);
        let mut engine = engine(&plc, EventSender::discard());

        let snap = engine.poll_once().unwrap();
        assert_eq!(snap.cycle(), 1);
        assert_eq!(snap.len(), 16 + 1 + 1);
        assert_eq!(snap.bit(&SignalId::bit(600, 0).unwrap()), Some(true));
        assert_eq!(snap.bit(&SignalId::bit(600, 1).unwrap()), Some(false));
        assert_eq!(snap.byte(&SignalId::byte(1003)), Some(1));
        assert_eq!(snap.float(&SignalId::float(1200)), Some(-3.25));
    }

    #[test]
    fn test_consumers_see_every_cycle_in_order() {
        let plc = SimulatedPlc::new(2048);
        let mut engine = engine(&plc, EventSender::discard());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.add_consumer(crate::snapshot::FnConsumer::new("record", move |s: &Snapshot| {
            sink.lock().push(s.cycle())
        }));
        for _ in 0..3 {
            engine.poll_once().unwrap();
        }
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_cycle_skips_consumers_and_escalates_once() {
        let plc = SimulatedPlc::new(2048);
        let (tx, rx) = channel(64);
        let mut engine = engine(&plc, tx);
        let calls = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&calls);
        engine.add_consumer(crate::snapshot::FnConsumer::new("count", move |_: &Snapshot| {
            *counter.lock() += 1
        }));

        plc.fail_next_reads(4);
        for _ in 0..4 {
            assert!(engine.poll_once().is_err());
        }
        assert!(engine.poll_once().is_ok());
        assert_eq!(*calls.lock(), 1);

        let stats = engine.stats();
        assert_eq!(stats.failed_cycles, 4);
        assert_eq!(stats.consecutive_failures, 0);

        let events: Vec<Event> = rx.try_iter().collect();
        let escalations = events
            .iter()
            .filter(|e| matches!(e, Event::ReadFailuresEscalated { consecutive: 3 }))
            .count();
        assert_eq!(escalations, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ReadsRecovered { after: 4 })));
    }

    #[test]
    fn test_short_read_is_cycle_failure() {
        let plc = SimulatedPlc::new(2048);
        let mut engine = engine(&plc, EventSender::discard());
        plc.short_next_reads(1);
        assert!(matches!(engine.poll_once(), Err(PlcError::Decode { .. })));
        assert!(engine.poll_once().is_ok());
    }

    #[test]
    fn test_reconnects_dropped_link() {
        let plc = SimulatedPlc::new(2048);
        let mut engine = engine(&plc, EventSender::discard());
        plc.drop_connection();
        assert!(engine.poll_once().is_ok());

        plc.drop_connection();
        plc.refuse_connections(true);
        assert!(matches!(
            engine.poll_once(),
            Err(PlcError::Connection { .. })
        ));
    }

    #[test]
    fn test_start_fails_on_refused_connection() {
        let plc = SimulatedPlc::new(2048);
        plc.refuse_connections(true);
        let (tx, rx) = channel(16);
        let link = Arc::new(DeviceLink::new(plc.clone()));
        let engine = PollingEngine::new(link, &small_map(), EngineConfig::default(), tx);

        let handle = engine.start().unwrap();
        assert!(matches!(handle.join(), Err(PlcError::Connection { .. })));
        let states: Vec<EngineState> = rx
            .try_iter()
            .filter_map(|e| match e {
                Event::StateChanged { state } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![EngineState::Connecting, EngineState::Idle]);
    }

    #[test]
    fn test_stop_disconnects() {
        let plc = SimulatedPlc::new(2048);
        let (tx, rx) = channel(256);
        let engine = engine(&plc, tx);
        let handle = engine.start().unwrap();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(handle.state(), EngineState::Polling);
        handle.stop();
        let stats = handle.join().unwrap();
        assert!(stats.cycles > 0);
        assert!(!crate::link::RegisterTransport::is_connected(&plc));
        assert!(rx.try_iter().any(|e| matches!(e, Event::Stopped { .. })));
    }

    #[test]
    fn test_engine_config_serde_millis() {
        let config: EngineConfig = toml::from_str("interval = 250\nfailure_backoff = 1000").unwrap();
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.failure_backoff, Duration::from_millis(1000));
        assert_eq!(config.escalation_threshold, 3);
    }
}
