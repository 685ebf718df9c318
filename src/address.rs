//! Register addressing for byte/bit-addressed PLC memory.
//!
//! Every signal lives in data block memory at a byte offset. Boolean signals
//! additionally carry a bit index (0-7) within that byte. Signals are named the
//! way the PLC programming tool names V-memory:
//!
//! | Form | Kind | Width |
//! |------|------|-------|
//! | `V750.0` | bit 0 of byte 750 | 1 bit |
//! | `VB1011` | raw byte at 1011 | 1 byte |
//! | `VD1200` | float starting at 1200 | 4 bytes |
//!
//! # Example
//!
//! ```
//! use plcwatch::{SignalId, SignalKind};
//!
//! let id: SignalId = "V750.7".parse().unwrap();
//! assert_eq!(id.kind(), SignalKind::Bit);
//! assert_eq!(id.offset(), 750);
//! assert_eq!(id.to_string(), "V750.7");
//!
//! let float: SignalId = "VD1200".parse().unwrap();
//! assert_eq!(float.width(), 4);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{PlcError, Result};

/// Highest valid bit index within a byte.
pub const MAX_BIT_INDEX: u8 = 7;

/// A byte offset plus, for boolean signals, a bit index 0-7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterAddress {
    /// Byte offset in the data block.
    pub offset: u32,
    /// Bit index for boolean signals.
    pub bit: Option<u8>,
}

impl RegisterAddress {
    /// Creates a byte address.
    pub fn byte(offset: u32) -> Self {
        Self { offset, bit: None }
    }

    /// Creates a bit address.
    ///
    /// # Errors
    ///
    /// Returns an error if `bit` > 7.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::RegisterAddress;
    ///
    /// let addr = RegisterAddress::bit(750, 7).unwrap();
    /// assert_eq!(addr.bit, Some(7));
    /// assert!(RegisterAddress::bit(750, 8).is_err());
    /// ```
    pub fn bit(offset: u32, bit: u8) -> Result<Self> {
        check_bit_index(bit)?;
        Ok(Self {
            offset,
            bit: Some(bit),
        })
    }
}

/// Validates a bit index.
pub(crate) fn check_bit_index(bit: u8) -> Result<()> {
    if bit > MAX_BIT_INDEX {
        return Err(PlcError::invalid_parameter("bit", "must be 0-7"));
    }
    Ok(())
}

/// Signal kinds carried in a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// One bit of a byte.
    Bit,
    /// A raw byte value 0..255.
    Byte,
    /// A 32-bit float spanning 4 bytes.
    Float,
}

/// Identifies a single signal in PLC memory.
///
/// Ordering sorts by offset first, so a sorted collection of ids follows
/// memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalId {
    /// Boolean signal `V{offset}.{bit}`.
    Bit {
        /// Byte offset.
        offset: u32,
        /// Bit index 0-7.
        bit: u8,
    },
    /// Raw byte signal `VB{offset}`.
    Byte {
        /// Byte offset.
        offset: u32,
    },
    /// Float signal `VD{offset}`.
    Float {
        /// Offset of the first of 4 bytes.
        offset: u32,
    },
}

impl SignalId {
    /// Creates a bit signal id.
    ///
    /// # Errors
    ///
    /// Returns an error if `bit` > 7.
    pub fn bit(offset: u32, bit: u8) -> Result<Self> {
        check_bit_index(bit)?;
        Ok(Self::Bit { offset, bit })
    }

    /// Creates a raw byte signal id.
    pub fn byte(offset: u32) -> Self {
        Self::Byte { offset }
    }

    /// Creates a float signal id.
    pub fn float(offset: u32) -> Self {
        Self::Float { offset }
    }

    /// Returns the kind of signal.
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Bit { .. } => SignalKind::Bit,
            Self::Byte { .. } => SignalKind::Byte,
            Self::Float { .. } => SignalKind::Float,
        }
    }

    /// Returns the starting byte offset.
    pub fn offset(&self) -> u32 {
        match *self {
            Self::Bit { offset, .. } | Self::Byte { offset } | Self::Float { offset } => offset,
        }
    }

    /// Returns the number of bytes that must be read to decode this signal.
    pub fn width(&self) -> u32 {
        match self {
            Self::Bit { .. } | Self::Byte { .. } => 1,
            Self::Float { .. } => 4,
        }
    }

    /// Returns the register address of this signal.
    pub fn address(&self) -> RegisterAddress {
        match *self {
            Self::Bit { offset, bit } => RegisterAddress {
                offset,
                bit: Some(bit),
            },
            Self::Byte { offset } | Self::Float { offset } => RegisterAddress::byte(offset),
        }
    }

    /// Returns the byte offset and bit index of a bit signal.
    ///
    /// Only bit signals can be targets of a bit write.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidAddressing` for byte and float signals.
    pub fn bit_address(&self) -> Result<(u32, u8)> {
        match *self {
            Self::Bit { offset, bit } => Ok((offset, bit)),
            Self::Byte { .. } | Self::Float { .. } => Err(PlcError::invalid_addressing(format!(
                "{} is not a bit signal",
                self
            ))),
        }
    }
}

impl SignalId {
    fn sort_key(&self) -> (u32, u8, u8) {
        match *self {
            Self::Bit { offset, bit } => (offset, 0, bit),
            Self::Byte { offset } => (offset, 1, 0),
            Self::Float { offset } => (offset, 2, 0),
        }
    }
}

impl Ord for SignalId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for SignalId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bit { offset, bit } => write!(f, "V{}.{}", offset, bit),
            Self::Byte { offset } => write!(f, "VB{}", offset),
            Self::Float { offset } => write!(f, "VD{}", offset),
        }
    }
}

impl FromStr for SignalId {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parse_offset = |digits: &str| {
            digits.parse::<u32>().map_err(|_| {
                PlcError::invalid_addressing(format!("'{}': invalid byte offset", s))
            })
        };

        if let Some(rest) = s.strip_prefix("VB") {
            return Ok(Self::byte(parse_offset(rest)?));
        }
        if let Some(rest) = s.strip_prefix("VD") {
            return Ok(Self::float(parse_offset(rest)?));
        }
        if let Some(rest) = s.strip_prefix('V') {
            let (offset, bit) = rest.split_once('.').ok_or_else(|| {
                PlcError::invalid_addressing(format!("'{}': expected V<byte>.<bit>", s))
            })?;
            let bit = bit.parse::<u8>().map_err(|_| {
                PlcError::invalid_addressing(format!("'{}': invalid bit index", s))
            })?;
            return Self::bit(parse_offset(offset)?, bit);
        }

        Err(PlcError::invalid_addressing(format!(
            "'{}': expected V<byte>.<bit>, VB<byte> or VD<byte>",
            s
        )))
    }
}

impl Serialize for SignalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SignalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
