//! S7 response parsing and validation.
//!
//! A data response frame has the layout:
//!
//! | Component | Size | Description |
//! |-----------|------|-------------|
//! | TPKT | 4 bytes | Version 3 + frame length |
//! | COTP | 3 bytes | `02 F0 80` |
//! | S7 header | 12 bytes | Ack-data header with error class/code |
//! | Parameters | `param_len` | Function code + item count (or setup parameters) |
//! | Data | `data_len` | Per item: return code, transport size, length, payload |
//!
//! A response is successful when the header error class/code are both 0 and
//! every item return code is 0xFF.
//!
//! # Example
//!
//! ```
//! use plcwatch::S7Response;
//!
//! let frame = [
//!     0x03, 0x00, 0x00, 0x1B, // TPKT
//!     0x02, 0xF0, 0x80, // COTP DT
//!     0x32, 0x03, 0x00, 0x00, 0x00, 0x05, 0x00, 0x02, 0x00, 0x06, 0x00, 0x00, // ack-data
//!     0x04, 0x01, // read var, 1 item
//!     0xFF, 0x04, 0x00, 0x10, 0x12, 0x34, // success, 16 bits
//! ];
//!
//! let response = S7Response::from_bytes(&frame).unwrap();
//! response.check_error().unwrap();
//! assert_eq!(response.read_data().unwrap(), vec![0x12, 0x34]);
//! ```

use crate::command::{COTP_CC, FUNC_READ_VAR, FUNC_SETUP_COMMUNICATION, FUNC_WRITE_VAR};
use crate::error::{PlcError, Result};
use crate::header::{S7Header, TpktHeader, COTP_DT, S7_HEADER_OFFSET, TPKT_HEADER_SIZE};

/// Item return code reporting success.
pub const RETURN_CODE_SUCCESS: u8 = 0xFF;

/// Data transport sizes whose length field counts bytes instead of bits.
const BYTE_LENGTH_TRANSPORTS: [u8; 3] = [0x03, 0x07, 0x09];

/// Validates a COTP connection confirm frame.
///
/// # Errors
///
/// Returns `PlcError::Connection` if the PLC rejected the connection request
/// and `PlcError::InvalidResponse` for malformed frames.
///
/// # Example
///
/// ```
/// use plcwatch::response::check_connection_confirm;
///
/// let cc = [0x03, 0x00, 0x00, 0x0B, 0x06, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00];
/// assert!(check_connection_confirm(&cc).is_ok());
/// ```
pub fn check_connection_confirm(frame: &[u8]) -> Result<()> {
    let tpkt = TpktHeader::from_bytes(frame)?;
    if frame.len() < tpkt.length as usize || frame.len() < TPKT_HEADER_SIZE + 2 {
        return Err(PlcError::invalid_response("connection confirm truncated"));
    }
    let pdu_type = frame[TPKT_HEADER_SIZE + 1];
    if pdu_type != COTP_CC {
        return Err(PlcError::connection(format!(
            "COTP connection refused (PDU type 0x{:02X})",
            pdu_type
        )));
    }
    Ok(())
}

/// Parsed S7 data response.
#[derive(Debug, Clone)]
pub struct S7Response {
    /// S7 header.
    pub header: S7Header,
    /// Parameter block.
    pub params: Vec<u8>,
    /// Data block.
    pub data: Vec<u8>,
}

impl S7Response {
    /// Parses a full TPKT frame.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidResponse` if any layer is malformed or the
    /// declared lengths overrun the frame.
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        let tpkt = TpktHeader::from_bytes(frame)?;
        let length = tpkt.length as usize;
        if frame.len() < length {
            return Err(PlcError::invalid_response(format!(
                "frame truncated: TPKT declares {} bytes, got {}",
                length,
                frame.len()
            )));
        }
        if length < S7_HEADER_OFFSET || frame[TPKT_HEADER_SIZE + 1] != COTP_DT {
            return Err(PlcError::invalid_response("expected COTP data transfer"));
        }

        let pdu = &frame[S7_HEADER_OFFSET..length];
        let header = S7Header::from_bytes(pdu)?;
        let params_start = header.size();
        let data_start = params_start + header.param_len as usize;
        let data_end = data_start + header.data_len as usize;
        if pdu.len() < data_end {
            return Err(PlcError::invalid_response(format!(
                "S7 PDU truncated: need {} bytes, got {}",
                data_end,
                pdu.len()
            )));
        }

        Ok(Self {
            header,
            params: pdu[params_start..data_start].to_vec(),
            data: pdu[data_start..data_end].to_vec(),
        })
    }

    /// Returns an error if the header reports an error class/code.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::PlcError` carrying the class and code.
    pub fn check_error(&self) -> Result<()> {
        if self.header.is_error() {
            return Err(PlcError::PlcError {
                class: self.header.error_class,
                code: self.header.error_code,
            });
        }
        Ok(())
    }

    /// Validates that the response answers the request with `expected` reference.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidResponse` on mismatch.
    pub fn check_pdu_ref(&self, expected: u16) -> Result<()> {
        if self.header.pdu_ref != expected {
            return Err(PlcError::invalid_response(format!(
                "PDU reference mismatch: expected {}, got {}",
                expected, self.header.pdu_ref
            )));
        }
        Ok(())
    }

    fn check_function(&self, function: u8) -> Result<()> {
        match self.params.first() {
            Some(&f) if f == function => Ok(()),
            Some(&f) => Err(PlcError::invalid_response(format!(
                "unexpected function 0x{:02X}, expected 0x{:02X}",
                f, function
            ))),
            None => Err(PlcError::invalid_response("missing parameter block")),
        }
    }

    /// Returns the PDU length granted by a setup communication response.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidResponse` if this is not a setup response.
    pub fn negotiated_pdu_length(&self) -> Result<u16> {
        self.check_function(FUNC_SETUP_COMMUNICATION)?;
        if self.params.len() < 8 {
            return Err(PlcError::invalid_response("setup parameters truncated"));
        }
        Ok(u16::from_be_bytes([self.params[6], self.params[7]]))
    }

    /// Extracts the payload of a single-item read var response.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::ItemError` for a failing item return code and
    /// `PlcError::InvalidResponse` for malformed data.
    pub fn read_data(&self) -> Result<Vec<u8>> {
        self.check_function(FUNC_READ_VAR)?;
        match self.data.first() {
            Some(&RETURN_CODE_SUCCESS) => {}
            Some(&return_code) => return Err(PlcError::ItemError { return_code }),
            None => return Err(PlcError::invalid_response("read item missing")),
        }
        if self.data.len() < 4 {
            return Err(PlcError::invalid_response("read item truncated"));
        }
        let transport_size = self.data[1];
        let raw_len = u16::from_be_bytes([self.data[2], self.data[3]]) as usize;
        let len = if BYTE_LENGTH_TRANSPORTS.contains(&transport_size) {
            raw_len
        } else {
            raw_len.div_ceil(8)
        };
        let payload = &self.data[4..];
        if payload.len() < len {
            return Err(PlcError::invalid_response(format!(
                "read item declares {} bytes, got {}",
                len,
                payload.len()
            )));
        }
        Ok(payload[..len].to_vec())
    }

    /// Validates a single-item write var response.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::ItemError` if the PLC rejected the write.
    pub fn check_write(&self) -> Result<()> {
        self.check_function(FUNC_WRITE_VAR)?;
        match self.data.first() {
            Some(&RETURN_CODE_SUCCESS) => Ok(()),
            Some(&return_code) => Err(PlcError::ItemError { return_code }),
            None => Err(PlcError::invalid_response("write item missing")),
        }
    }
}
