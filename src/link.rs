//! Device link: the single owned connection to PLC memory.
//!
//! [`RegisterTransport`] is the byte-level capability a concrete transport
//! provides ("read N bytes at offset B of the data block", "write N bytes at
//! offset B"). [`DeviceLink`] owns exactly one transport behind a mutex and
//! adds the read-modify-write bit primitive on top of it.
//!
//! All access goes through the same lock, so a bit write is never interleaved
//! with another write (or with the polling read) on the same connection. Two
//! writers toggling different bits of the same status byte therefore cannot
//! lose each other's update.
//!
//! # Example
//!
//! ```
//! use plcwatch::{BitWriter, DeviceLink, SimulatedPlc};
//!
//! let plc = SimulatedPlc::new(2048);
//! plc.poke(750, 0b0000_0001);
//!
//! let link = DeviceLink::new(plc.clone());
//! link.connect().unwrap();
//! link.set_bit(750, 7, true).unwrap();
//! assert_eq!(plc.peek(750), 0b1000_0001);
//! ```

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::address::check_bit_index;
use crate::codec::encode_bit_write;
use crate::error::{PlcError, Result};

/// Byte-level access to PLC memory.
///
/// Implementations perform blocking I/O bounded by their own timeout.
pub trait RegisterTransport: Send {
    /// Opens the connection.
    fn connect(&mut self) -> Result<()>;

    /// Returns whether the connection is open.
    fn is_connected(&self) -> bool;

    /// Reads `len` bytes starting at byte `offset`.
    fn read_bytes(&mut self, offset: u32, len: usize) -> Result<Vec<u8>>;

    /// Writes `data` starting at byte `offset`.
    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Closes the connection. Closing a closed transport is a no-op.
    fn disconnect(&mut self);
}

/// The only externally invokable mutation of PLC memory.
pub trait BitWriter: Send + Sync {
    /// Sets or clears bit `bit` of the byte at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bit index is invalid or the write fails.
    fn set_bit(&self, offset: u32, bit: u8, value: bool) -> Result<()>;
}

/// Serialized access to one [`RegisterTransport`].
pub struct DeviceLink {
    transport: Mutex<Box<dyn RegisterTransport>>,
}

impl DeviceLink {
    /// Wraps a transport.
    pub fn new(transport: impl RegisterTransport + 'static) -> Self {
        Self {
            transport: Mutex::new(Box::new(transport)),
        }
    }

    /// Opens the connection.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Connection` (or the transport's error) on failure.
    pub fn connect(&self) -> Result<()> {
        let mut transport = self.transport.lock();
        transport.connect()?;
        info!("PLC link connected");
        Ok(())
    }

    /// Returns whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.transport.lock().is_connected()
    }

    /// Reads exactly `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, or `PlcError::Decode` if it returned a
    /// buffer of the wrong size.
    pub fn read_bytes(&self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let data = self.transport.lock().read_bytes(offset, len)?;
        if data.len() != len {
            return Err(PlcError::decode(offset, len, data.len()));
        }
        Ok(data)
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub fn write_bytes(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.transport.lock().write_bytes(offset, data)
    }

    /// Sets or clears one bit with a read-modify-write of its byte.
    ///
    /// The lock is held across the read and the write.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidParameter` for a bit index above 7 and
    /// `PlcError::Write` if either half of the read-modify-write fails.
    pub fn write_bit(&self, offset: u32, bit: u8, value: bool) -> Result<()> {
        check_bit_index(bit)?;
        let mut transport = self.transport.lock();
        let current = match transport.read_bytes(offset, 1) {
            Ok(data) if data.len() == 1 => data[0],
            Ok(data) => {
                return Err(PlcError::write(
                    offset,
                    format!("read-back returned {} bytes", data.len()),
                ))
            }
            Err(e) => return Err(PlcError::write(offset, format!("read-back failed: {}", e))),
        };
        let updated = encode_bit_write(current, bit, value);
        transport
            .write_bytes(offset, &[updated])
            .map_err(|e| match e {
                PlcError::Write { .. } => e,
                other => PlcError::write(offset, other.to_string()),
            })?;
        debug!(offset, bit, value, before = current, after = updated, "bit written");
        Ok(())
    }

    /// Closes the connection.
    pub fn disconnect(&self) {
        self.transport.lock().disconnect();
        info!("PLC link disconnected");
    }
}

impl BitWriter for DeviceLink {
    fn set_bit(&self, offset: u32, bit: u8, value: bool) -> Result<()> {
        self.write_bit(offset, bit, value)
    }
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedPlc;
    use std::sync::Arc;
    use std::thread;

    fn connected(plc: &SimulatedPlc) -> DeviceLink {
        let link = DeviceLink::new(plc.clone());
        link.connect().unwrap();
        link
    }

    #[test]
    fn test_write_bit_preserves_other_bits() {
        let plc = SimulatedPlc::new(1024);
        plc.poke(400, 0b1010_1010);
        let link = connected(&plc);

        link.write_bit(400, 0, true).unwrap();
        assert_eq!(plc.peek(400), 0b1010_1011);
        link.write_bit(400, 7, false).unwrap();
        assert_eq!(plc.peek(400), 0b0010_1011);
    }

    #[test]
    fn test_write_bit_rejects_bad_index() {
        let plc = SimulatedPlc::new(16);
        let link = connected(&plc);
        assert!(matches!(
            link.write_bit(0, 8, true),
            Err(PlcError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_read_short_buffer_is_decode_error() {
        let plc = SimulatedPlc::new(64);
        let link = connected(&plc);
        plc.short_next_reads(1);
        let err = link.read_bytes(10, 4).unwrap_err();
        assert!(matches!(
            err,
            PlcError::Decode {
                offset: 10,
                expected: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_write_failure_is_reported() {
        let plc = SimulatedPlc::new(64);
        let link = connected(&plc);
        plc.fail_next_writes(1);
        assert!(matches!(
            link.write_bit(5, 1, true),
            Err(PlcError::Write { offset: 5, .. })
        ));
        assert_eq!(plc.peek(5), 0);
    }

    #[test]
    fn test_concurrent_bit_writes_do_not_race() {
        let plc = SimulatedPlc::new(1024);
        let link = Arc::new(connected(&plc));

        let handles: Vec<_> = (0..8u8)
            .map(|bit| {
                let link = Arc::clone(&link);
                thread::spawn(move || {
                    for _ in 0..50 {
                        link.set_bit(750, bit, false).unwrap();
                        link.set_bit(750, bit, true).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(plc.peek(750), 0xFF);
    }

    #[test]
    fn test_not_connected() {
        let plc = SimulatedPlc::new(16);
        let link = DeviceLink::new(plc);
        assert!(!link.is_connected());
        assert!(matches!(link.read_bytes(0, 1), Err(PlcError::NotConnected)));
    }
}
