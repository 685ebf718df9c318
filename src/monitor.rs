//! Application wiring.
//!
//! A [`Monitor`] owns the device link, the shared database and every
//! consumer built from an [`AppConfig`]. Consumers are shared behind
//! `Arc<Mutex<_>>` so operator actions (acknowledging a tool change, setting a
//! tray capacity) reach the same state the polling thread updates.
//!
//! ```text
//! PLC --> DeviceLink --> PollingEngine --> Snapshot --+--> ToolBank (one per bank)
//!              ^                                      +--> TrayBank
//!              |                                      +--> ProductionCounter
//!              +---- BitWriter <--- write-backs       +--> AlarmLogger
//!                                                     +--> ControlPanel
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::alarm::{AlarmLogger, AlarmStore};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::control::ControlPanel;
use crate::engine::{EngineHandle, PollingEngine};
use crate::error::Result;
use crate::event::EventSender;
use crate::link::{BitWriter, DeviceLink, RegisterTransport};
use crate::production::{ProductionCounter, ProductionStore};
use crate::storage::Storage;
use crate::tool_life::{ToolBank, ToolHistoryStore};
use crate::tray::TrayBank;

/// Everything needed to monitor one PLC.
pub struct Monitor {
    config: AppConfig,
    link: Arc<DeviceLink>,
    storage: Storage,
    events: EventSender,
    clock: Arc<dyn Clock>,
    tool_banks: Vec<Arc<Mutex<ToolBank>>>,
    trays: Arc<Mutex<TrayBank>>,
    production: Arc<Mutex<ProductionCounter>>,
    alarms: Arc<Mutex<AlarmLogger>>,
    control: Arc<ControlPanel>,
}

impl Monitor {
    /// Opens the configured database and builds every consumer.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Storage` if the database cannot be opened.
    pub fn new(
        config: AppConfig,
        transport: impl RegisterTransport + 'static,
        events: EventSender,
    ) -> Result<Self> {
        let storage = Storage::open(&config.storage.path)?;
        Ok(Self::with_storage(
            config,
            transport,
            storage,
            events,
            Arc::new(SystemClock),
        ))
    }

    /// Builds every consumer on an already opened database.
    ///
    /// Alarm intervals past their retention are purged here.
    pub fn with_storage(
        config: AppConfig,
        transport: impl RegisterTransport + 'static,
        storage: Storage,
        events: EventSender,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let link = Arc::new(DeviceLink::new(transport));
        let writer: Arc<dyn BitWriter> = link.clone();

        let tool_banks = config
            .tool_banks
            .iter()
            .map(|bank| {
                let bank = ToolBank::new(
                    bank.clone(),
                    Arc::clone(&writer),
                    Some(ToolHistoryStore::new(storage.clone())),
                    events.clone(),
                )
                .with_clock(Arc::clone(&clock));
                Arc::new(Mutex::new(bank))
            })
            .collect();

        let trays = TrayBank::new(config.trays.clone(), Arc::clone(&writer), events.clone());

        let production = ProductionCounter::with_clock(
            &config.production,
            ProductionStore::new(storage.clone()),
            events.clone(),
            Arc::clone(&clock),
        );

        let alarms = AlarmLogger::new(
            config.alarms.fields.clone(),
            AlarmStore::new(storage.clone()),
            events.clone(),
        )
        .with_clock(Arc::clone(&clock));
        match alarms.purge_expired(config.alarms.retention_days) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "purged expired alarm intervals"),
            Err(e) => warn!(error = %e, "failed to purge alarm log"),
        }

        let control = Arc::new(ControlPanel::new(
            config.control.clone(),
            Arc::clone(&writer),
            events.clone(),
        ));

        Self {
            config,
            link,
            storage,
            events,
            clock,
            tool_banks,
            trays: Arc::new(Mutex::new(trays)),
            production: Arc::new(Mutex::new(production)),
            alarms: Arc::new(Mutex::new(alarms)),
            control,
        }
    }

    /// Builds a polling engine that feeds every consumer.
    ///
    /// Consumers are shared, so they keep their state across engines.
    pub fn engine(&self) -> PollingEngine {
        let mut engine = PollingEngine::new(
            Arc::clone(&self.link),
            &self.config.register_map,
            self.config.polling.clone(),
            self.events.clone(),
        )
        .with_clock(Arc::clone(&self.clock));

        for bank in &self.tool_banks {
            engine.add_consumer(Arc::clone(bank));
        }
        engine.add_consumer(Arc::clone(&self.trays));
        engine.add_consumer(Arc::clone(&self.production));
        engine.add_consumer(Arc::clone(&self.alarms));
        engine.add_consumer(Arc::clone(&self.control));
        engine
    }

    /// Starts polling on a dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the polling thread cannot be spawned.
    pub fn start(&self) -> Result<EngineHandle> {
        info!(
            plc = %self.config.plc.socket_addr(),
            banks = self.tool_banks.len(),
            alarms = self.config.alarms.fields.len(),
            "starting monitor"
        );
        self.engine().start()
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Returns the shared device link.
    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// Returns the shared database.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Returns every tool bank in configuration order.
    pub fn tool_banks(&self) -> &[Arc<Mutex<ToolBank>>] {
        &self.tool_banks
    }

    /// Returns the tool bank called `name`.
    pub fn tool_bank(&self, name: &str) -> Option<Arc<Mutex<ToolBank>>> {
        self.tool_banks
            .iter()
            .find(|bank| bank.lock().name() == name)
            .cloned()
    }

    /// Returns the tray bank.
    pub fn trays(&self) -> &Arc<Mutex<TrayBank>> {
        &self.trays
    }

    /// Returns the production counter.
    pub fn production(&self) -> &Arc<Mutex<ProductionCounter>> {
        &self.production
    }

    /// Returns the alarm logger.
    pub fn alarms(&self) -> &Arc<Mutex<AlarmLogger>> {
        &self.alarms
    }

    /// Returns the command panel.
    pub fn control(&self) -> &Arc<ControlPanel> {
        &self.control
    }

    /// Returns a store handle on the tool change history.
    pub fn tool_history(&self) -> ToolHistoryStore {
        ToolHistoryStore::new(self.storage.clone())
    }

    /// Returns a store handle on the alarm log.
    pub fn alarm_store(&self) -> AlarmStore {
        AlarmStore::new(self.storage.clone())
    }

    /// Returns a store handle on the production history.
    pub fn production_store(&self) -> ProductionStore {
        ProductionStore::new(self.storage.clone())
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("plc", &self.config.plc.socket_addr())
            .field("link", &self.link)
            .field("tool_banks", &self.tool_banks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::simulator::SimulatedPlc;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn monitor(plc: &SimulatedPlc) -> Monitor {
        let mut config = AppConfig::default();
        config.polling.interval = Duration::from_millis(5);
        let clock = ManualClock::at(
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
        );
        Monitor::with_storage(
            config,
            plc.clone(),
            Storage::in_memory().unwrap(),
            EventSender::discard(),
            Arc::new(clock),
        )
    }

    #[test]
    fn test_builds_configured_consumers() {
        let plc = SimulatedPlc::new(2048);
        let monitor = monitor(&plc);
        assert_eq!(monitor.tool_banks().len(), 2);
        assert!(monitor.tool_bank("machine_b").is_some());
        assert!(monitor.tool_bank("machine_c").is_none());
        assert_eq!(monitor.trays().lock().trays().len(), 2);
        assert_eq!(
            monitor.production().lock().current_date(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
    }

    #[test]
    fn test_start_and_stop() {
        let plc = SimulatedPlc::new(2048);
        let monitor = monitor(&plc);
        let handle = monitor.start().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        handle.stop();
        let stats = handle.join().unwrap();
        assert!(stats.cycles > 0);
        assert!(!monitor.link().is_connected());
    }
}
