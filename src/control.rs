//! Operator command panel.
//!
//! Two kinds of command bits exist:
//!
//! - pulse commands (pause, resume, start, stop, home, auto/manual toggle)
//!   are written true, held for the pulse width and written false;
//! - momentary commands (gripper 1, gripper 2, blow) follow the pressed state
//!   of the operator's button and are only accepted in manual mode.
//!
//! The panel learns whether the robot is in manual mode from every snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::address::SignalId;
use crate::error::{PlcError, Result};
use crate::event::{Event, EventSender};
use crate::link::BitWriter;
use crate::snapshot::{Snapshot, SnapshotConsumer};

/// An operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Pause the cycle.
    Pause,
    /// Resume a paused cycle.
    Resume,
    /// Start the cycle.
    Start,
    /// Stop the cycle.
    Stop,
    /// Move the robot home.
    Home,
    /// Toggle automatic/manual mode.
    AutoManual,
    /// Raw-material gripper.
    Gripper1,
    /// Finished-part gripper.
    Gripper2,
    /// Air blow.
    Blow,
}

impl Command {
    /// Every command.
    pub const ALL: [Command; 9] = [
        Command::Pause,
        Command::Resume,
        Command::Start,
        Command::Stop,
        Command::Home,
        Command::AutoManual,
        Command::Gripper1,
        Command::Gripper2,
        Command::Blow,
    ];

    /// Returns whether the command follows a held button instead of pulsing.
    pub fn is_momentary(self) -> bool {
        matches!(self, Self::Gripper1 | Self::Gripper2 | Self::Blow)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Home => "home",
            Self::AutoManual => "auto_manual",
            Self::Gripper1 => "gripper1",
            Self::Gripper2 => "gripper2",
            Self::Blow => "blow",
        };
        f.write_str(name)
    }
}

/// Command bit layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Pause output bit.
    pub pause: SignalId,
    /// Resume output bit.
    pub resume: SignalId,
    /// Start output bit.
    pub start: SignalId,
    /// Stop output bit.
    pub stop: SignalId,
    /// Home output bit.
    pub home: SignalId,
    /// Auto/manual toggle output bit.
    pub auto_manual: SignalId,
    /// Gripper 1 output bit.
    pub gripper1: SignalId,
    /// Gripper 2 output bit.
    pub gripper2: SignalId,
    /// Blow output bit.
    pub blow: SignalId,
    /// Byte reporting the robot mode.
    pub mode_signal: SignalId,
    /// Value of `mode_signal` meaning manual mode.
    pub manual_value: u8,
    /// How long pulse commands stay true.
    #[serde(with = "crate::engine::millis")]
    pub pulse_width: Duration,
}

impl ControlConfig {
    /// Returns the output bit of `command`.
    pub fn signal(&self, command: Command) -> SignalId {
        match command {
            Command::Pause => self.pause,
            Command::Resume => self.resume,
            Command::Start => self.start,
            Command::Stop => self.stop,
            Command::Home => self.home,
            Command::AutoManual => self.auto_manual,
            Command::Gripper1 => self.gripper1,
            Command::Gripper2 => self.gripper2,
            Command::Blow => self.blow,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        let bit = |offset, bit| SignalId::Bit { offset, bit };
        Self {
            pause: bit(400, 0),
            resume: bit(400, 1),
            start: bit(400, 2),
            stop: bit(400, 3),
            home: bit(400, 4),
            auto_manual: bit(400, 5),
            gripper1: bit(300, 0),
            gripper2: bit(300, 1),
            blow: bit(300, 2),
            mode_signal: SignalId::Byte { offset: 1003 },
            manual_value: 1,
            pulse_width: Duration::from_millis(300),
        }
    }
}

/// Issues operator commands through the shared bit writer.
pub struct ControlPanel {
    config: ControlConfig,
    writer: Arc<dyn BitWriter>,
    events: EventSender,
    manual: AtomicBool,
    states: Mutex<BTreeMap<Command, bool>>,
}

impl ControlPanel {
    /// Creates a panel that starts in automatic mode with every command off.
    pub fn new(config: ControlConfig, writer: Arc<dyn BitWriter>, events: EventSender) -> Self {
        Self {
            config,
            writer,
            events,
            manual: AtomicBool::new(false),
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns whether the PLC last reported manual mode.
    pub fn is_manual(&self) -> bool {
        self.manual.load(Ordering::SeqCst)
    }

    /// Records the robot mode. Emits an event when it changes.
    pub fn set_manual_mode(&self, manual: bool) {
        if self.manual.swap(manual, Ordering::SeqCst) != manual {
            info!(manual, "robot mode changed");
            self.events.send(Event::ManualModeChanged { manual });
        }
    }

    /// Returns the last commanded state of `command`.
    pub fn state(&self, command: Command) -> bool {
        self.states.lock().get(&command).copied().unwrap_or(false)
    }

    fn write(&self, command: Command, value: bool) -> Result<()> {
        let (offset, bit) = self.config.signal(command).bit_address()?;
        self.states.lock().insert(command, value);
        self.writer
            .set_bit(offset, bit, value)
            .inspect_err(|e| {
                self.events.send(Event::WriteFailed {
                    offset,
                    bit,
                    error: e.to_string(),
                })
            })?;
        debug!(%command, value, "command bit written");
        Ok(())
    }

    /// Pulses a command bit: true, wait the pulse width, false.
    ///
    /// Blocks the caller for the pulse width.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for a momentary command and the
    /// write error if either write fails.
    pub fn pulse(&self, command: Command) -> Result<()> {
        if command.is_momentary() {
            return Err(PlcError::invalid_parameter(
                "command",
                format!("'{}' is a momentary command", command),
            ));
        }
        self.write(command, true)?;
        info!(%command, "command pulsed");
        thread::sleep(self.config.pulse_width);
        self.write(command, false)
    }

    /// Applies the pressed state of a momentary command.
    ///
    /// Returns `false` without writing when the robot is not in manual mode.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for a pulse command and the
    /// write error if the write fails.
    pub fn press(&self, command: Command, pressed: bool) -> Result<bool> {
        if !command.is_momentary() {
            return Err(PlcError::invalid_parameter(
                "command",
                format!("'{}' is a pulse command", command),
            ));
        }
        if !self.is_manual() {
            debug!(%command, "ignored outside manual mode");
            return Ok(false);
        }
        self.write(command, pressed)?;
        Ok(true)
    }
}

impl SnapshotConsumer for Arc<ControlPanel> {
    fn on_snapshot(&mut self, snapshot: &Snapshot) {
        if let Some(mode) = snapshot.get(&self.config.mode_signal) {
            self.set_manual_mode(mode.as_i64() == i64::from(self.config.manual_value));
        }
    }

    fn name(&self) -> &str {
        "control panel"
    }
}

impl fmt::Debug for ControlPanel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPanel")
            .field("manual", &self.is_manual())
            .field("states", &*self.states.lock())
            .finish_non_exhaustive()
    }
}
