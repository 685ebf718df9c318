//! Application configuration.
//!
//! The whole configuration lives in one TOML file. Every section has
//! defaults that reproduce the reference machine, so an empty file (or no
//! file at all) is a valid configuration.
//!
//! ```toml
//! [plc]
//! ip = "192.168.58.10"
//! slot = 1
//!
//! [polling]
//! interval = 100
//!
//! [logging]
//! level = "debug"
//!
//! [[tool_banks]]
//! name = "machine_a"
//! trigger = "V600.0"
//! attention = "V750.7"
//! slots = 24
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::address::{SignalId, MAX_BIT_INDEX};
use crate::alarm::{default_alarm_fields, AlarmField, DEFAULT_RETENTION_DAYS};
use crate::client::ClientConfig;
use crate::command::{DEFAULT_PDU_LENGTH, MAX_BYTE_OFFSET};
use crate::control::{Command, ControlConfig};
use crate::engine::EngineConfig;
use crate::production::ProductionConfig;
use crate::register_map::RegisterMap;
use crate::tool_life::ToolBankConfig;
use crate::transport::{DEFAULT_S7_PORT, DEFAULT_TIMEOUT};
use crate::tray::TrayBankConfig;

/// Error type for configuration loading.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read configuration file {path}: {reason}")]
    Read {
        /// File that was requested.
        path: String,
        /// Underlying I/O error text.
        reason: String,
    },

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Log level for application logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug information.
    Debug,
    /// General operation.
    #[default]
    Info,
    /// Potential problems.
    Warn,
    /// Serious problems only.
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// `[plc]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    /// PLC IPv4 address.
    pub ip: Ipv4Addr,
    /// ISO-on-TCP port.
    pub port: u16,
    /// CPU rack.
    pub rack: u8,
    /// CPU slot.
    pub slot: u8,
    /// Data block holding the register map.
    pub db: u16,
    /// Socket timeout in milliseconds.
    pub timeout_ms: u64,
    /// Requested PDU length.
    pub pdu_length: u16,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            ip: Ipv4Addr::new(192, 168, 58, 10),
            port: DEFAULT_S7_PORT,
            rack: 0,
            slot: 1,
            db: 1,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            pdu_length: DEFAULT_PDU_LENGTH,
        }
    }
}

impl PlcConfig {
    /// Builds the S7 client configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.ip)
            .with_port(self.port)
            .with_rack(self.rack)
            .with_slot(self.slot)
            .with_db(self.db)
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_pdu_length(self.pdu_length)
    }

    /// Returns the PLC socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("plcwatch.db"),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

/// `[alarms]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Days a logged interval is kept.
    pub retention_days: u32,
    /// Tracked alarm fields.
    pub fields: Vec<AlarmField>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            fields: default_alarm_fields(),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// PLC connection.
    pub plc: PlcConfig,
    /// Polling loop.
    pub polling: EngineConfig,
    /// Database location.
    pub storage: StorageConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Signals read every cycle.
    pub register_map: RegisterMap,
    /// Tool-life banks.
    pub tool_banks: Vec<ToolBankConfig>,
    /// Tray counters.
    pub trays: TrayBankConfig,
    /// Production counter.
    pub production: ProductionConfig,
    /// Alarm logger.
    pub alarms: AlarmConfig,
    /// Operator command bits.
    pub control: ControlConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plc: PlcConfig::default(),
            polling: EngineConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            register_map: RegisterMap::default(),
            tool_banks: ToolBankConfig::defaults(),
            trays: TrayBankConfig::default(),
            production: ProductionConfig::default(),
            alarms: AlarmConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads, parses and validates a configuration file.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Read` if the file cannot be read
    /// - `ConfigError::Parse` if the TOML is invalid
    /// - `ConfigError::Validation` if a value is out of range
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text)
    }

    /// Parses and validates configuration text.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::config::AppConfig;
    ///
    /// let config = AppConfig::from_toml("[polling]\ninterval = 250\n").unwrap();
    /// assert_eq!(config.polling.interval.as_millis(), 250);
    /// assert_eq!(config.tool_banks.len(), 2);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` or `ConfigError::Validation`.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` if a value cannot be represented.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks cross-section consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if:
    /// - the polling interval, alarm retention or pulse width is zero
    /// - a referenced signal is not part of the register map
    /// - a bit index is above 7
    /// - a write-back target (tool attention, tray full output, control
    ///   command) is not a bit signal
    /// - an offset lies outside the data block address range
    /// - bank, tray or alarm names repeat
    /// - a tool bank has no slots
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.interval.is_zero() {
            return Err(invalid("polling.interval must be greater than 0"));
        }
        if self.alarms.retention_days == 0 {
            return Err(invalid("alarms.retention_days must be greater than 0"));
        }
        if self.control.pulse_width.is_zero() {
            return Err(invalid("control.pulse_width must be greater than 0"));
        }
        if self.register_map.max_span == 0 {
            return Err(invalid("register_map.max_span must be greater than 0"));
        }
        if self.plc.timeout_ms == 0 {
            return Err(invalid("plc.timeout_ms must be greater than 0"));
        }

        unique("tool bank", self.tool_banks.iter().map(|b| b.name.as_str()))?;
        unique("tray", self.trays.trays.iter().map(|t| t.id.as_str()))?;
        unique("alarm", self.alarms.fields.iter().map(|f| f.name.as_str()))?;

        for bank in &self.tool_banks {
            if bank.slots == 0 {
                return Err(invalid(format!("tool bank '{}' has no slots", bank.name)));
            }
        }

        for offset in self
            .register_map
            .bit_groups
            .iter()
            .chain(&self.register_map.bytes)
            .chain(&self.register_map.floats)
        {
            if *offset > MAX_BYTE_OFFSET - 3 {
                return Err(invalid(format!(
                    "register_map: offset {} above {}",
                    offset,
                    MAX_BYTE_OFFSET - 3
                )));
            }
        }
        if self.register_map.max_gap > self.register_map.max_span {
            return Err(invalid("register_map.max_gap must not exceed max_span"));
        }

        for (context, signal) in self.write_targets() {
            if signal.bit_address().is_err() {
                return Err(invalid(format!(
                    "{}: {} is not a bit signal",
                    context, signal
                )));
            }
        }

        for (context, signal) in self.referenced_signals() {
            if let Some(bit) = signal.address().bit {
                if bit > MAX_BIT_INDEX {
                    return Err(invalid(format!("{}: bit index {} above 7", context, bit)));
                }
            }
            if !self.register_map.contains(&signal) {
                return Err(invalid(format!(
                    "{}: signal {} is not in the register map",
                    context, signal
                )));
            }
        }
        Ok(())
    }

    /// Signals written bit-wise by the consumers.
    fn write_targets(&self) -> Vec<(String, SignalId)> {
        let mut signals = Vec::new();
        for bank in &self.tool_banks {
            signals.push((format!("tool bank '{}' attention", bank.name), bank.attention));
        }
        if let Some(output) = self.trays.full_output {
            signals.push(("trays.full_output".to_string(), output));
        }
        for command in Command::ALL {
            signals.push((format!("control.{}", command), self.control.signal(command)));
        }
        signals
    }

    fn referenced_signals(&self) -> Vec<(String, SignalId)> {
        let mut signals = self.write_targets();
        for bank in &self.tool_banks {
            signals.push((format!("tool bank '{}' trigger", bank.name), bank.trigger));
        }
        for tray in &self.trays.trays {
            signals.push((format!("tray '{}' trigger", tray.id), tray.trigger));
        }
        signals.push(("production.trigger".to_string(), self.production.trigger));
        for field in &self.alarms.fields {
            signals.push((format!("alarm '{}'", field.name), field.signal));
        }
        signals.push(("control.mode_signal".to_string(), self.control.mode_signal));
        signals
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn unique<'a>(what: &str, names: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for name in names {
        if name.is_empty() {
            return Err(invalid(format!("{} name cannot be empty", what)));
        }
        if !seen.insert(name) {
            return Err(invalid(format!("duplicate {} name '{}'", what, name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tray::TrayConfig;

    #[test]
    fn test_default_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tool_banks.len(), 2);
        assert_eq!(config.alarms.fields.len(), 7);
        assert_eq!(config.plc.client_config().pdu_length, DEFAULT_PDU_LENGTH);
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        assert_eq!(AppConfig::from_toml("").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_to_toml_round_trip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[plc]"));
        assert!(text.contains("[[tool_banks]]"));
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_sections_override() {
        let text = r#"
[plc]
ip = "10.0.0.5"
timeout_ms = 250

[logging]
level = "debug"
json = true

[[tool_banks]]
name = "lathe"
trigger = "V600.1"
attention = "V601.0"
slots = 4
"#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.plc.ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(config.plc.port, DEFAULT_S7_PORT);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(config.logging.json);
        assert_eq!(config.tool_banks.len(), 1);
        assert_eq!(config.tool_banks[0].slots, 4);
        assert_eq!(
            config.plc.client_config().timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_unmapped_signal_rejected() {
        let mut config = AppConfig::default();
        config.production.trigger = SignalId::bit(950, 0).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("V950.0")));
    }

    #[test]
    fn test_bit_index_checked() {
        let mut config = AppConfig::default();
        config.production.trigger = SignalId::Bit {
            offset: 750,
            bit: 9,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut config = AppConfig::default();
        config.polling.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.alarms.retention_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = AppConfig::default();
        config.trays.trays.push(TrayConfig {
            id: "tray1".to_string(),
            trigger: SignalId::bit(750, 0).unwrap(),
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate tray name"));
    }

    #[test]
    fn test_byte_write_target_rejected() {
        let text = r#"
[[tool_banks]]
name = "machine_a"
trigger = "V600.0"
attention = "VB1011"
slots = 24
"#;
        let err = AppConfig::from_toml(text).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref m) if m.contains("VB1011")));

        let mut config = AppConfig::default();
        config.trays.full_output = Some(SignalId::float(1200));
        assert!(config.validate().unwrap_err().to_string().contains("not a bit signal"));

        let mut config = AppConfig::default();
        config.control.pause = SignalId::byte(1003);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_offset_range_checked() {
        let mut config = AppConfig::default();
        config.register_map.bytes.push(u32::MAX);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("register_map: offset"));

        let mut config = AppConfig::default();
        config.register_map.max_gap = u32::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_and_read_errors() {
        assert!(matches!(
            AppConfig::from_toml("[plc\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AppConfig::from_toml("[production]\ntrigger = \"X1\"\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            AppConfig::load("/nonexistent/plcwatch.toml"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plcwatch.toml");
        fs::write(&path, "[storage]\npath = \"/var/lib/plcwatch.db\"\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/var/lib/plcwatch.db"));
    }
}
