//! S7 request frames.
//!
//! Each request type builds its own complete wire frame (TPKT + COTP + S7):
//!
//! - [`ConnectionRequest`] - COTP connection request selecting rack/slot via TSAP
//! - [`SetupCommunication`] - negotiates the PDU length after the COTP connect
//! - [`ReadVarCommand`] - reads a byte range from a data block
//! - [`WriteVarCommand`] - writes a byte range to a data block
//!
//! # Example
//!
//! ```
//! use plcwatch::command::ReadVarCommand;
//!
//! let cmd = ReadVarCommand::new(0x0001, 1, 400, 2).unwrap();
//! let bytes = cmd.to_bytes();
//! assert_eq!(bytes.len(), 31);
//! ```

use crate::error::{PlcError, Result};
use crate::header::{S7Header, TpktHeader, COTP_DATA_HEADER, TPKT_HEADER_SIZE};

/// Parameter function code: setup communication.
pub(crate) const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;
/// Parameter function code: read var.
pub(crate) const FUNC_READ_VAR: u8 = 0x04;
/// Parameter function code: write var.
pub(crate) const FUNC_WRITE_VAR: u8 = 0x05;

/// Memory area code for data blocks.
pub const AREA_DB: u8 = 0x84;

/// Item transport size: BYTE.
pub const TRANSPORT_SIZE_BYTE: u8 = 0x02;

/// Data transport size for byte writes; the length field counts bits.
pub const DATA_TRANSPORT_BYTE: u8 = 0x04;

/// PDU length requested during setup communication.
pub const DEFAULT_PDU_LENGTH: u16 = 480;

/// Smallest PDU length a PLC may negotiate.
pub const MIN_PDU_LENGTH: u16 = 240;

/// Bytes of a read-var response PDU that are not payload.
pub const READ_RESPONSE_OVERHEAD: usize = 18;

/// Bytes of a write-var request PDU that are not payload.
pub const WRITE_REQUEST_OVERHEAD: usize = 28;

/// Local TSAP presented by this client.
pub const LOCAL_TSAP: u16 = 0x0100;

/// Highest byte offset whose bit address still fits in 24 bits.
pub const MAX_BYTE_OFFSET: u32 = 0x00FF_FFFF >> 3;

/// Largest single write payload; its length in bits must fit in 16 bits.
pub const MAX_WRITE_BYTES: usize = (u16::MAX as usize) / 8;

/// COTP PDU type: connection request.
pub(crate) const COTP_CR: u8 = 0xE0;
/// COTP PDU type: connection confirm.
pub(crate) const COTP_CC: u8 = 0xD0;

/// Returns the remote TSAP addressing the CPU at `rack`/`slot`.
///
/// # Errors
///
/// Returns an error if rack > 7 or slot > 31.
///
/// # Example
///
/// ```
/// use plcwatch::command::remote_tsap;
///
/// assert_eq!(remote_tsap(0, 1).unwrap(), 0x0101);
/// assert_eq!(remote_tsap(0, 2).unwrap(), 0x0102);
/// assert!(remote_tsap(8, 0).is_err());
/// ```
pub fn remote_tsap(rack: u8, slot: u8) -> Result<u16> {
    if rack > 7 {
        return Err(PlcError::invalid_parameter("rack", "must be 0-7"));
    }
    if slot > 31 {
        return Err(PlcError::invalid_parameter("slot", "must be 0-31"));
    }
    Ok(0x0100 | (u16::from(rack) * 0x20 + u16::from(slot)))
}

/// Builds a full data frame from an S7 header, parameter block and data block.
fn data_frame(header: &S7Header, params: &[u8], data: &[u8]) -> Vec<u8> {
    let total = TPKT_HEADER_SIZE + COTP_DATA_HEADER.len() + header.size() + params.len() + data.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&TpktHeader::new(total as u16).to_bytes());
    frame.extend_from_slice(&COTP_DATA_HEADER);
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}

/// Encodes a DB item specification (12 bytes).
fn item_spec(db: u16, offset: u32, length: u16) -> [u8; 12] {
    let bit_address = offset << 3;
    let count = length.to_be_bytes();
    let db = db.to_be_bytes();
    [
        0x12,
        0x0A,
        0x10,
        TRANSPORT_SIZE_BYTE,
        count[0],
        count[1],
        db[0],
        db[1],
        AREA_DB,
        (bit_address >> 16) as u8,
        (bit_address >> 8) as u8,
        bit_address as u8,
    ]
}

fn check_offset(offset: u32) -> Result<()> {
    if offset > MAX_BYTE_OFFSET {
        return Err(PlcError::invalid_addressing(format!(
            "byte offset {} exceeds {}",
            offset, MAX_BYTE_OFFSET
        )));
    }
    Ok(())
}

/// COTP connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    local_tsap: u16,
    remote_tsap: u16,
}

impl ConnectionRequest {
    /// Creates a connection request for the CPU at `rack`/`slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if rack or slot are out of range.
    pub fn new(rack: u8, slot: u8) -> Result<Self> {
        Ok(Self {
            local_tsap: LOCAL_TSAP,
            remote_tsap: remote_tsap(rack, slot)?,
        })
    }

    /// Serializes the request to a TPKT frame.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::command::ConnectionRequest;
    ///
    /// let bytes = ConnectionRequest::new(0, 1).unwrap().to_bytes();
    /// assert_eq!(bytes.len(), 22);
    /// assert_eq!(&bytes[..4], &[0x03, 0x00, 0x00, 0x16]);
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let local = self.local_tsap.to_be_bytes();
        let remote = self.remote_tsap.to_be_bytes();
        let cotp = [
            0x11, // length indicator
            COTP_CR,
            0x00,
            0x00, // destination reference
            0x00,
            0x01, // source reference
            0x00, // class 0
            0xC0,
            0x01,
            0x0A, // TPDU size 1024
            0xC1,
            0x02,
            local[0],
            local[1],
            0xC2,
            0x02,
            remote[0],
            remote[1],
        ];
        let mut frame = TpktHeader::new((TPKT_HEADER_SIZE + cotp.len()) as u16)
            .to_bytes()
            .to_vec();
        frame.extend_from_slice(&cotp);
        frame
    }
}

/// Setup communication job negotiating the PDU length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupCommunication {
    pdu_ref: u16,
    pdu_length: u16,
}

impl SetupCommunication {
    /// Creates a setup request asking for `pdu_length` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `pdu_length` is below [`MIN_PDU_LENGTH`].
    pub fn new(pdu_ref: u16, pdu_length: u16) -> Result<Self> {
        if pdu_length < MIN_PDU_LENGTH {
            return Err(PlcError::invalid_parameter(
                "pdu_length",
                format!("must be at least {}", MIN_PDU_LENGTH),
            ));
        }
        Ok(Self {
            pdu_ref,
            pdu_length,
        })
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let pdu = self.pdu_length.to_be_bytes();
        let params = [
            FUNC_SETUP_COMMUNICATION,
            0x00,
            0x00,
            0x01, // max AMQ calling
            0x00,
            0x01, // max AMQ called
            pdu[0],
            pdu[1],
        ];
        let header = S7Header::job(self.pdu_ref, params.len() as u16, 0);
        data_frame(&header, &params, &[])
    }
}

/// Read var job for a single byte range of a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadVarCommand {
    pdu_ref: u16,
    db: u16,
    offset: u32,
    length: u16,
}

impl ReadVarCommand {
    /// Creates a read request for `length` bytes at `offset` in `db`.
    ///
    /// # Errors
    ///
    /// Returns an error if `length` is 0 or the offset cannot be addressed.
    pub fn new(pdu_ref: u16, db: u16, offset: u32, length: u16) -> Result<Self> {
        if length == 0 {
            return Err(PlcError::invalid_parameter(
                "length",
                "must be greater than 0",
            ));
        }
        check_offset(offset)?;
        Ok(Self {
            pdu_ref,
            db,
            offset,
            length,
        })
    }

    /// Returns the number of bytes requested.
    pub fn length(&self) -> u16 {
        self.length
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut params = Vec::with_capacity(14);
        params.push(FUNC_READ_VAR);
        params.push(0x01); // item count
        params.extend_from_slice(&item_spec(self.db, self.offset, self.length));
        let header = S7Header::job(self.pdu_ref, params.len() as u16, 0);
        data_frame(&header, &params, &[])
    }
}

/// Write var job for a single byte range of a data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteVarCommand {
    pdu_ref: u16,
    db: u16,
    offset: u32,
    data: Vec<u8>,
}

impl WriteVarCommand {
    /// Creates a write request for `data` at `offset` in `db`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is empty, longer than [`MAX_WRITE_BYTES`],
    /// or the offset cannot be addressed.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::command::WriteVarCommand;
    ///
    /// let cmd = WriteVarCommand::new(0x0002, 1, 750, &[0x80]).unwrap();
    /// assert_eq!(cmd.to_bytes().len(), 36);
    /// assert!(WriteVarCommand::new(0x0002, 1, 750, &[]).is_err());
    /// ```
    pub fn new(pdu_ref: u16, db: u16, offset: u32, data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(PlcError::invalid_parameter("data", "must not be empty"));
        }
        if data.len() > MAX_WRITE_BYTES {
            return Err(PlcError::invalid_parameter(
                "data",
                format!("must not exceed {} bytes", MAX_WRITE_BYTES),
            ));
        }
        check_offset(offset)?;
        Ok(Self {
            pdu_ref,
            db,
            offset,
            data: data.to_vec(),
        })
    }

    /// Serializes the request.
    pub fn to_bytes(&self) -> Vec<u8> {
        let length = self.data.len() as u16;
        let mut params = Vec::with_capacity(14);
        params.push(FUNC_WRITE_VAR);
        params.push(0x01);
        params.extend_from_slice(&item_spec(self.db, self.offset, length));

        let mut data = Vec::with_capacity(4 + self.data.len());
        data.push(0x00); // reserved return code
        data.push(DATA_TRANSPORT_BYTE);
        data.extend_from_slice(&(length * 8).to_be_bytes());
        data.extend_from_slice(&self.data);

        let header = S7Header::job(self.pdu_ref, params.len() as u16, data.len() as u16);
        data_frame(&header, &params, &data)
    }
}
