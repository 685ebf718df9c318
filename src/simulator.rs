//! In-process simulated PLC memory.
//!
//! [`SimulatedPlc`] stands in for a real controller: a flat byte array that
//! implements [`RegisterTransport`]. Handles are cheap clones sharing the same
//! memory, so a test can keep one handle to poke signals while a
//! [`DeviceLink`](crate::DeviceLink) owns another.
//!
//! Faults can be injected to exercise error paths: refused connections,
//! failing reads or writes, and short reads that trigger decode failures.
//!
//! # Example
//!
//! ```
//! use plcwatch::{RegisterTransport, SimulatedPlc};
//!
//! let plc = SimulatedPlc::new(2048);
//! plc.write_float(1200, 12.5);
//! plc.set_bit(600, 0, true);
//!
//! let mut transport = plc.clone();
//! transport.connect().unwrap();
//! assert_eq!(transport.read_bytes(600, 1).unwrap(), vec![0x01]);
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::codec::{encode_bit_write, encode_float};
use crate::error::{PlcError, Result};
use crate::link::RegisterTransport;

/// Item return code for an out-of-range address.
const ADDRESS_OUT_OF_RANGE: u8 = 0x05;

#[derive(Debug, Default)]
struct SimState {
    memory: Vec<u8>,
    connected: bool,
    refuse_connect: bool,
    fail_reads: u32,
    fail_writes: u32,
    short_reads: u32,
    read_calls: u64,
    write_calls: u64,
}

/// Simulated PLC data block with fault injection.
#[derive(Debug, Clone)]
pub struct SimulatedPlc {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPlc {
    /// Creates a zeroed data block of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                memory: vec![0; size],
                ..SimState::default()
            })),
        }
    }

    /// Returns the data block size.
    pub fn size(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Sets a raw byte. Out-of-range offsets are ignored.
    pub fn poke(&self, offset: u32, value: u8) {
        if let Some(byte) = self.state.lock().memory.get_mut(offset as usize) {
            *byte = value;
        }
    }

    /// Returns a raw byte, or 0 for out-of-range offsets.
    pub fn peek(&self, offset: u32) -> u8 {
        self.state
            .lock()
            .memory
            .get(offset as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Returns bit `bit` of the byte at `offset`.
    pub fn bit(&self, offset: u32, bit: u8) -> bool {
        crate::codec::get_bit(self.peek(offset), bit)
    }

    /// Sets or clears one bit.
    pub fn set_bit(&self, offset: u32, bit: u8, value: bool) {
        let current = self.peek(offset);
        self.poke(offset, encode_bit_write(current, bit, value));
    }

    /// Stores a float in the PLC's word-swapped layout.
    pub fn write_float(&self, offset: u32, value: f32) {
        for (i, byte) in encode_float(value).into_iter().enumerate() {
            self.poke(offset + i as u32, byte);
        }
    }

    /// Makes subsequent connection attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Makes the next `count` reads fail with a read error.
    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().fail_reads = count;
    }

    /// Makes the next `count` writes fail with a write error.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().fail_writes = count;
    }

    /// Makes the next `count` reads return one byte fewer than requested.
    pub fn short_next_reads(&self, count: u32) {
        self.state.lock().short_reads = count;
    }

    /// Drops the connection as if the cable was pulled.
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    /// Returns the number of read calls served or failed.
    pub fn read_calls(&self) -> u64 {
        self.state.lock().read_calls
    }

    /// Returns the number of write calls served or failed.
    pub fn write_calls(&self) -> u64 {
        self.state.lock().write_calls
    }

    fn range(memory: &[u8], offset: u32, len: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start + len;
        if len == 0 || end > memory.len() {
            return Err(PlcError::ItemError {
                return_code: ADDRESS_OUT_OF_RANGE,
            });
        }
        Ok(start..end)
    }
}

impl RegisterTransport for SimulatedPlc {
    fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.refuse_connect {
            return Err(PlcError::connection("simulated PLC refused connection"));
        }
        state.connected = true;
        debug!(size = state.memory.len(), "simulated PLC connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn read_bytes(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(PlcError::NotConnected);
        }
        state.read_calls += 1;
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(PlcError::read(offset, "simulated read failure"));
        }
        let range = Self::range(&state.memory, offset, len)?;
        let mut data = state.memory[range].to_vec();
        if state.short_reads > 0 {
            state.short_reads -= 1;
            data.pop();
        }
        Ok(data)
    }

    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(PlcError::NotConnected);
        }
        state.write_calls += 1;
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(PlcError::write(offset, "simulated write failure"));
        }
        let range = Self::range(&state.memory, offset, data.len())?;
        state.memory[range].copy_from_slice(data);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state.lock().connected = false;
    }
}
