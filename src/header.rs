//! ISO-on-TCP framing and S7 PDU headers.
//!
//! Every frame exchanged with the PLC is wrapped in three layers:
//!
//! | Layer | Size | Description |
//! |-------|------|-------------|
//! | TPKT | 4 bytes | Version (3), reserved, total frame length (big-endian) |
//! | COTP | 3 bytes (data) | Length indicator, PDU type (0xF0 = DT), EOT flag |
//! | S7 | 10 or 12 bytes | Protocol id (0x32), ROSCTR, PDU reference, parameter/data lengths |
//!
//! Connection setup frames carry a longer COTP connection request instead of
//! the data header; those are built in [`command`](crate::command).
//!
//! # Example
//!
//! ```
//! use plcwatch::header::{Rosctr, S7Header, TpktHeader};
//!
//! let header = S7Header::job(0x0001, 14, 0);
//! let bytes = header.to_bytes();
//! assert_eq!(bytes.len(), 10);
//! assert_eq!(bytes[0], 0x32);
//! assert_eq!(header.rosctr, Rosctr::Job);
//!
//! let tpkt = TpktHeader::new(31);
//! assert_eq!(tpkt.to_bytes(), [0x03, 0x00, 0x00, 0x1F]);
//! ```

use crate::error::{PlcError, Result};

/// TPKT header size in bytes.
pub const TPKT_HEADER_SIZE: usize = 4;

/// TPKT protocol version.
pub const TPKT_VERSION: u8 = 0x03;

/// COTP data header: length indicator 2, PDU type DT, last data unit.
pub const COTP_DATA_HEADER: [u8; 3] = [0x02, 0xF0, 0x80];

/// COTP data header size in bytes.
pub const COTP_DATA_SIZE: usize = COTP_DATA_HEADER.len();

/// COTP PDU type of a data transfer.
pub const COTP_DT: u8 = 0xF0;

/// S7 protocol identifier.
pub const S7_PROTOCOL_ID: u8 = 0x32;

/// S7 header size for job requests.
pub const S7_JOB_HEADER_SIZE: usize = 10;

/// S7 header size for ack-data responses (job header + error class/code).
pub const S7_ACK_HEADER_SIZE: usize = 12;

/// Offset of the S7 header within a full data frame.
pub const S7_HEADER_OFFSET: usize = TPKT_HEADER_SIZE + COTP_DATA_SIZE;

/// S7 message type (ROSCTR).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rosctr {
    /// Request sent to the PLC.
    Job,
    /// Acknowledgement without data.
    Ack,
    /// Acknowledgement carrying parameters and data.
    AckData,
    /// Extended user data.
    UserData,
}

impl Rosctr {
    /// Returns the wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Job => 0x01,
            Self::Ack => 0x02,
            Self::AckData => 0x03,
            Self::UserData => 0x07,
        }
    }

    /// Parses a wire code.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidResponse` for unknown codes.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x01 => Ok(Self::Job),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::AckData),
            0x07 => Ok(Self::UserData),
            other => Err(PlcError::invalid_response(format!(
                "unknown ROSCTR 0x{:02X}",
                other
            ))),
        }
    }

    /// Returns whether this message type carries the error class/code pair.
    pub fn has_error_fields(self) -> bool {
        matches!(self, Self::Ack | Self::AckData)
    }
}

/// TPKT (RFC 1006) header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpktHeader {
    /// Total frame length including this header.
    pub length: u16,
}

impl TpktHeader {
    /// Creates a header for a frame of `length` bytes in total.
    pub fn new(length: u16) -> Self {
        Self { length }
    }

    /// Serializes the header.
    pub fn to_bytes(self) -> [u8; TPKT_HEADER_SIZE] {
        let len = self.length.to_be_bytes();
        [TPKT_VERSION, 0x00, len[0], len[1]]
    }

    /// Parses a header.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidResponse` if the slice is too short, the version
    /// is not 3, or the length cannot hold the header itself.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::header::TpktHeader;
    ///
    /// let header = TpktHeader::from_bytes(&[0x03, 0x00, 0x00, 0x16]).unwrap();
    /// assert_eq!(header.length, 22);
    /// assert!(TpktHeader::from_bytes(&[0x02, 0x00, 0x00, 0x16]).is_err());
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < TPKT_HEADER_SIZE {
            return Err(PlcError::invalid_response(format!(
                "TPKT header too short: expected {} bytes, got {}",
                TPKT_HEADER_SIZE,
                data.len()
            )));
        }
        if data[0] != TPKT_VERSION {
            return Err(PlcError::invalid_response(format!(
                "unsupported TPKT version {}",
                data[0]
            )));
        }
        let length = u16::from_be_bytes([data[2], data[3]]);
        if (length as usize) < TPKT_HEADER_SIZE {
            return Err(PlcError::invalid_response(format!(
                "TPKT length {} shorter than header",
                length
            )));
        }
        Ok(Self { length })
    }

    /// Returns the number of bytes that follow the TPKT header.
    pub fn payload_len(self) -> usize {
        self.length as usize - TPKT_HEADER_SIZE
    }
}

/// S7 PDU header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Header {
    /// Message type.
    pub rosctr: Rosctr,
    /// PDU reference echoed back by the PLC.
    pub pdu_ref: u16,
    /// Length of the parameter block.
    pub param_len: u16,
    /// Length of the data block.
    pub data_len: u16,
    /// Error class (ack and ack-data only).
    pub error_class: u8,
    /// Error code (ack and ack-data only).
    pub error_code: u8,
}

impl S7Header {
    /// Creates a job header.
    pub fn job(pdu_ref: u16, param_len: u16, data_len: u16) -> Self {
        Self {
            rosctr: Rosctr::Job,
            pdu_ref,
            param_len,
            data_len,
            error_class: 0,
            error_code: 0,
        }
    }

    /// Returns the encoded size of this header.
    pub fn size(&self) -> usize {
        if self.rosctr.has_error_fields() {
            S7_ACK_HEADER_SIZE
        } else {
            S7_JOB_HEADER_SIZE
        }
    }

    /// Serializes the header; ack types include the error class and code.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.size());
        bytes.push(S7_PROTOCOL_ID);
        bytes.push(self.rosctr.code());
        bytes.extend_from_slice(&[0x00, 0x00]);
        bytes.extend_from_slice(&self.pdu_ref.to_be_bytes());
        bytes.extend_from_slice(&self.param_len.to_be_bytes());
        bytes.extend_from_slice(&self.data_len.to_be_bytes());
        if self.rosctr.has_error_fields() {
            bytes.push(self.error_class);
            bytes.push(self.error_code);
        }
        bytes
    }

    /// Parses a header from the start of an S7 PDU.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::InvalidResponse` if the slice is too short, the
    /// protocol id is wrong, or the ROSCTR is unknown.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::header::{Rosctr, S7Header};
    ///
    /// let bytes = [0x32, 0x03, 0x00, 0x00, 0x00, 0x07, 0x00, 0x02, 0x00, 0x05, 0x00, 0x00];
    /// let header = S7Header::from_bytes(&bytes).unwrap();
    /// assert_eq!(header.rosctr, Rosctr::AckData);
    /// assert_eq!(header.pdu_ref, 7);
    /// assert_eq!(header.data_len, 5);
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < S7_JOB_HEADER_SIZE {
            return Err(PlcError::invalid_response(format!(
                "S7 header too short: expected at least {} bytes, got {}",
                S7_JOB_HEADER_SIZE,
                data.len()
            )));
        }
        if data[0] != S7_PROTOCOL_ID {
            return Err(PlcError::invalid_response(format!(
                "bad S7 protocol id 0x{:02X}",
                data[0]
            )));
        }
        let rosctr = Rosctr::from_code(data[1])?;
        let (error_class, error_code) = if rosctr.has_error_fields() {
            if data.len() < S7_ACK_HEADER_SIZE {
                return Err(PlcError::invalid_response(format!(
                    "S7 ack header too short: expected {} bytes, got {}",
                    S7_ACK_HEADER_SIZE,
                    data.len()
                )));
            }
            (data[10], data[11])
        } else {
            (0, 0)
        };

        Ok(Self {
            rosctr,
            pdu_ref: u16::from_be_bytes([data[4], data[5]]),
            param_len: u16::from_be_bytes([data[6], data[7]]),
            data_len: u16::from_be_bytes([data[8], data[9]]),
            error_class,
            error_code,
        })
    }

    /// Returns whether the header reports an error.
    pub fn is_error(&self) -> bool {
        self.error_class != 0 || self.error_code != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tpkt_roundtrip() {
        let bytes = TpktHeader::new(0x0123).to_bytes();
        assert_eq!(bytes, [0x03, 0x00, 0x01, 0x23]);
        assert_eq!(TpktHeader::from_bytes(&bytes).unwrap().payload_len(), 0x0123 - 4);
    }

    #[test]
    fn test_tpkt_rejects_short_length() {
        assert!(TpktHeader::from_bytes(&[0x03, 0x00, 0x00, 0x02]).is_err());
        assert!(TpktHeader::from_bytes(&[0x03, 0x00]).is_err());
    }

    #[test]
    fn test_cotp_data_header() {
        assert_eq!(hex::encode(COTP_DATA_HEADER), "02f080");
        assert_eq!(S7_HEADER_OFFSET, 7);
    }

    #[test]
    fn test_job_header_bytes() {
        let header = S7Header::job(0x0102, 14, 4);
        assert_eq!(hex::encode(header.to_bytes()), "320100000102000e0004");
    }

    #[test]
    fn test_ack_header_parse_with_error() {
        let bytes = hex::decode("320300000005000200008105").unwrap();
        let header = S7Header::from_bytes(&bytes).unwrap();
        assert_eq!(header.rosctr, Rosctr::AckData);
        assert_eq!(header.pdu_ref, 5);
        assert!(header.is_error());
        assert_eq!((header.error_class, header.error_code), (0x81, 0x05));
        assert_eq!(header.to_bytes(), bytes);
    }

    #[test]
    fn test_header_rejects_bad_protocol() {
        let bytes = hex::decode("330100000001000e0000").unwrap();
        assert!(S7Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_ack_header_truncated() {
        let bytes = hex::decode("3203000000010002000081").unwrap();
        assert!(S7Header::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rosctr_codes() {
        for rosctr in [Rosctr::Job, Rosctr::Ack, Rosctr::AckData, Rosctr::UserData] {
            assert_eq!(Rosctr::from_code(rosctr.code()).unwrap(), rosctr);
        }
        assert!(Rosctr::from_code(0x09).is_err());
    }
}
