//! Error types for PLC access and state tracking.

use std::io;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for plcwatch operations.
pub type Result<T> = std::result::Result<T, PlcError>;

/// Errors that can occur while talking to the PLC or persisting derived state.
#[derive(Debug, Error)]
pub enum PlcError {
    /// The connection to the PLC could not be established.
    #[error("Connection failed: {reason}")]
    Connection {
        /// Description of the connection failure.
        reason: String,
    },

    /// An operation was attempted while the link was disconnected.
    #[error("Not connected to PLC")]
    NotConnected,

    /// A read from PLC memory failed.
    #[error("Read failed at byte {offset}: {reason}")]
    Read {
        /// Byte offset of the failed read.
        offset: u32,
        /// Description of the failure.
        reason: String,
    },

    /// A write to PLC memory failed.
    #[error("Write failed at byte {offset}: {reason}")]
    Write {
        /// Byte offset of the failed write.
        offset: u32,
        /// Description of the failure.
        reason: String,
    },

    /// The transport returned a buffer of unexpected size.
    #[error("Decode failed at byte {offset}: expected {expected} bytes, got {actual}")]
    Decode {
        /// Byte offset of the read that produced the buffer.
        offset: u32,
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes returned.
        actual: usize,
    },

    /// Error class/code reported by the PLC in an S7 response.
    #[error("PLC error: class 0x{class:02X}, code 0x{code:02X}")]
    PlcError {
        /// S7 error class.
        class: u8,
        /// S7 error code.
        code: u8,
    },

    /// Per-item return code other than success in a read/write var response.
    #[error("PLC item error: return code 0x{return_code:02X} ({})", item_error_description(*return_code))]
    ItemError {
        /// S7 data item return code.
        return_code: u8,
    },

    /// Invalid memory addressing.
    #[error("Invalid addressing: {reason}")]
    InvalidAddressing {
        /// Description of the addressing error.
        reason: String,
    },

    /// Invalid parameter provided.
    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of why the parameter is invalid.
        reason: String,
    },

    /// Invalid frame received from the PLC.
    #[error("Invalid response: {reason}")]
    InvalidResponse {
        /// Description of the response error.
        reason: String,
    },

    /// Communication timeout.
    #[error("Communication timeout")]
    Timeout,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Local storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PlcError {
    /// Creates a new `Connection` error.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::PlcError;
    ///
    /// let err = PlcError::connection("connection refused");
    /// assert_eq!(err.to_string(), "Connection failed: connection refused");
    /// ```
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Creates a new `Read` error.
    pub fn read(offset: u32, reason: impl Into<String>) -> Self {
        Self::Read {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a new `Write` error.
    pub fn write(offset: u32, reason: impl Into<String>) -> Self {
        Self::Write {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a new `Decode` error.
    pub fn decode(offset: u32, expected: usize, actual: usize) -> Self {
        Self::Decode {
            offset,
            expected,
            actual,
        }
    }

    /// Creates a new `InvalidAddressing` error.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::PlcError;
    ///
    /// let err = PlcError::invalid_addressing("bit index 9 out of range");
    /// ```
    pub fn invalid_addressing(reason: impl Into<String>) -> Self {
        Self::InvalidAddressing {
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidParameter` error.
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidResponse` error.
    pub fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    /// Returns whether the polling loop should treat this error as a skipped cycle
    /// rather than a reason to stop.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::PlcError;
    ///
    /// assert!(PlcError::Timeout.is_transient());
    /// assert!(PlcError::decode(400, 1, 0).is_transient());
    /// assert!(!PlcError::invalid_addressing("bad").is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Read { .. }
                | Self::Decode { .. }
                | Self::Timeout
                | Self::Io(_)
                | Self::PlcError { .. }
                | Self::ItemError { .. }
                | Self::InvalidResponse { .. }
        )
    }
}

/// Returns a human-readable description for an S7 data item return code.
///
/// # Example
///
/// ```
/// use plcwatch::item_error_description;
///
/// assert_eq!(item_error_description(0x0A), "object does not exist");
/// ```
pub fn item_error_description(return_code: u8) -> &'static str {
    match return_code {
        0xFF => "success",
        0x01 => "hardware fault",
        0x03 => "access to object not allowed",
        0x05 => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        0x0A => "object does not exist",
        _ => "unknown return code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_error_display() {
        let err = PlcError::read(400, "socket closed");
        assert_eq!(err.to_string(), "Read failed at byte 400: socket closed");
    }

    #[test]
    fn test_decode_error_display() {
        let err = PlcError::decode(1200, 4, 2);
        assert_eq!(
            err.to_string(),
            "Decode failed at byte 1200: expected 4 bytes, got 2"
        );
    }

    #[test]
    fn test_item_error_display() {
        let err = PlcError::ItemError { return_code: 0x05 };
        assert_eq!(
            err.to_string(),
            "PLC item error: return code 0x05 (address out of range)"
        );
    }

    #[test]
    fn test_plc_error_display() {
        let err = PlcError::PlcError {
            class: 0x81,
            code: 0x04,
        };
        assert_eq!(err.to_string(), "PLC error: class 0x81, code 0x04");
    }

    #[test]
    fn test_transient_classification() {
        assert!(PlcError::read(0, "x").is_transient());
        assert!(PlcError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "x")).is_transient());
        assert!(!PlcError::connection("x").is_transient());
        assert!(!PlcError::NotConnected.is_transient());
        assert!(!PlcError::write(0, "x").is_transient());
    }
}
