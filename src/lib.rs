//! # plcwatch
//!
//! Polls a Siemens S7 PLC data block on a fixed interval, decodes the raw
//! bytes into typed signals and feeds every consistent snapshot to a set of
//! counters and loggers:
//!
//! - **tool life**: counts uses per tool slot and raises an attention bit
//!   when a tool reaches its configured life;
//! - **trays**: counts pieces per tray against a capacity;
//! - **production**: keeps one persistent tally per calendar day;
//! - **alarms**: logs each active period of an alarm field as an interval.
//!
//! The only writes to the PLC are single-bit write-backs (attention flags,
//! tray-full flag and operator commands), all serialized with the polling
//! reads through one [`DeviceLink`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use plcwatch::config::AppConfig;
//! use plcwatch::event;
//! use plcwatch::monitor::Monitor;
//! use plcwatch::S7Client;
//!
//! fn main() -> plcwatch::Result<()> {
//!     let config = AppConfig::load("plcwatch.toml")?;
//!     let (events, rx) = event::channel(event::DEFAULT_EVENT_CAPACITY);
//!
//!     let client = S7Client::new(config.plc.client_config());
//!     let monitor = Monitor::new(config, client, events)?;
//!     let handle = monitor.start()?;
//!
//!     for event in rx.iter().take(100) {
//!         println!("{:?}", event);
//!     }
//!
//!     handle.stop();
//!     handle.join()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Signals
//!
//! Signals are addressed by byte offset inside the data block:
//!
//! | Notation | Kind | Width | Decoding |
//! |----------|------|:-----:|----------|
//! | `V750.0` | [`SignalKind::Bit`] | 1 bit | bit 0 is the least significant |
//! | `VB1011` | [`SignalKind::Byte`] | 1 byte | unsigned |
//! | `VD1200` | [`SignalKind::Float`] | 4 bytes | IEEE-754, 16-bit words swapped |
//!
//! ```
//! use plcwatch::{SignalId, SignalKind};
//!
//! let id: SignalId = "V750.7".parse()?;
//! assert_eq!(id.kind(), SignalKind::Bit);
//! assert_eq!(id.offset(), 750);
//! # Ok::<(), plcwatch::PlcError>(())
//! ```
//!
//! ## Polling without the wiring
//!
//! ```
//! use std::sync::Arc;
//! use plcwatch::{DeviceLink, EngineConfig, PollingEngine, RegisterMap, SignalId, SimulatedPlc};
//! use plcwatch::event::EventSender;
//!
//! let plc = SimulatedPlc::new(2048);
//! plc.set_bit(750, 0, true);
//! plc.write_float(1200, 12.5);
//!
//! let link = Arc::new(DeviceLink::new(plc.clone()));
//! link.connect()?;
//! let mut engine = PollingEngine::new(
//!     link,
//!     &RegisterMap::default(),
//!     EngineConfig::default(),
//!     EventSender::discard(),
//! );
//!
//! let snapshot = engine.poll_once()?;
//! assert_eq!(snapshot.bit(&"V750.0".parse::<SignalId>()?), Some(true));
//! assert_eq!(snapshot.float(&SignalId::float(1200)), Some(12.5));
//! # Ok::<(), plcwatch::PlcError>(())
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, PlcError>`](Result). The library never
//! panics on PLC data.
//!
//! ```no_run
//! use plcwatch::{ClientConfig, PlcError, RegisterTransport, S7Client};
//! use std::net::Ipv4Addr;
//!
//! let mut client = S7Client::new(ClientConfig::new(Ipv4Addr::new(192, 168, 58, 10)));
//! client.connect()?;
//!
//! match client.read_bytes(1200, 4) {
//!     Ok(data) => println!("VD1200 raw: {:02X?}", data),
//!     Err(PlcError::Timeout) => println!("Communication timeout"),
//!     Err(PlcError::PlcError { class, code }) => {
//!         println!("PLC error: class=0x{:02X}, code=0x{:02X}", class, code);
//!     }
//!     Err(e) => println!("Error: {}", e),
//! }
//! # Ok::<(), PlcError>(())
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod address;
pub mod alarm;
mod client;
pub mod clock;
pub mod codec;
pub mod command;
pub mod config;
pub mod control;
mod edge;
mod engine;
mod error;
pub mod event;
pub mod header;
mod link;
pub mod logging;
pub mod monitor;
pub mod production;
mod register_map;
pub mod response;
mod simulator;
mod snapshot;
pub mod storage;
pub mod tool_life;
mod transport;
pub mod tray;

// Public re-exports
pub use address::{RegisterAddress, SignalId, SignalKind, MAX_BIT_INDEX};
pub use client::{ClientConfig, S7Client};
pub use edge::{Edge, EdgeTracker};
pub use engine::{CycleStats, EngineConfig, EngineHandle, EngineState, PollingEngine};
pub use error::{item_error_description, PlcError, Result};
pub use link::{BitWriter, DeviceLink, RegisterTransport};
pub use register_map::{ReadPlan, ReadSpan, RegisterMap, DEFAULT_MAX_GAP, DEFAULT_MAX_SPAN};
pub use response::S7Response;
pub use simulator::SimulatedPlc;
pub use snapshot::{FnConsumer, SignalValue, Snapshot, SnapshotConsumer};
pub use transport::{TcpTransport, DEFAULT_S7_PORT, DEFAULT_TIMEOUT, MAX_FRAME_SIZE};
