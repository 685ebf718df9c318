//! High-level S7 client for reading and writing a PLC data block.
//!
//! This module provides [`S7Client`], the concrete [`RegisterTransport`] used
//! against real hardware.
//!
//! # Overview
//!
//! The client handles:
//! - TCP connect, COTP connection request and PDU length negotiation
//! - Request construction and response correlation via PDU reference
//! - Response parsing and error checking
//! - Splitting reads and writes that exceed the negotiated PDU size
//!
//! # Example
//!
//! ```no_run
//! use plcwatch::{ClientConfig, RegisterTransport, S7Client};
//! use std::net::Ipv4Addr;
//!
//! let config = ClientConfig::new(Ipv4Addr::new(192, 168, 58, 10)).with_slot(1);
//! let mut client = S7Client::new(config);
//! client.connect()?;
//!
//! let status = client.read_bytes(400, 4)?;
//! client.write_bytes(750, &[0x80])?;
//! # Ok::<(), plcwatch::PlcError>(())
//! ```
//!
//! # Connection loss
//!
//! A timeout or socket error leaves the stream in an unknown position, so the
//! client closes the socket and reports [`is_connected`](RegisterTransport::is_connected)
//! as false until the next [`connect`](RegisterTransport::connect).

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::command::{
    ConnectionRequest, ReadVarCommand, SetupCommunication, WriteVarCommand, DEFAULT_PDU_LENGTH,
    READ_RESPONSE_OVERHEAD, WRITE_REQUEST_OVERHEAD,
};
use crate::error::{PlcError, Result};
use crate::link::RegisterTransport;
use crate::response::{check_connection_confirm, S7Response};
use crate::transport::{TcpTransport, DEFAULT_S7_PORT, DEFAULT_TIMEOUT};

/// Configuration for creating an S7 client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// PLC socket address.
    pub plc_addr: SocketAddr,
    /// CPU rack number.
    pub rack: u8,
    /// CPU slot number.
    pub slot: u8,
    /// Data block number holding the register map.
    pub db: u16,
    /// Connect, read and write timeout.
    pub timeout: Duration,
    /// PDU length requested during setup.
    pub pdu_length: u16,
}

impl ClientConfig {
    /// Creates a configuration with default port (102), rack 0, slot 1 and DB 1.
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::ClientConfig;
    /// use std::net::Ipv4Addr;
    ///
    /// let config = ClientConfig::new(Ipv4Addr::new(192, 168, 58, 10));
    /// assert_eq!(config.plc_addr.port(), 102);
    /// assert_eq!(config.db, 1);
    /// ```
    pub fn new(plc_ip: Ipv4Addr) -> Self {
        Self {
            plc_addr: SocketAddr::from((plc_ip, DEFAULT_S7_PORT)),
            rack: 0,
            slot: 1,
            db: 1,
            timeout: DEFAULT_TIMEOUT,
            pdu_length: DEFAULT_PDU_LENGTH,
        }
    }

    /// Sets a custom PLC port (default is 102).
    pub fn with_port(mut self, port: u16) -> Self {
        self.plc_addr.set_port(port);
        self
    }

    /// Sets a custom timeout (default is 2 seconds).
    ///
    /// # Example
    ///
    /// ```
    /// use plcwatch::ClientConfig;
    /// use std::net::Ipv4Addr;
    /// use std::time::Duration;
    ///
    /// let config = ClientConfig::new(Ipv4Addr::new(192, 168, 58, 10))
    ///     .with_timeout(Duration::from_millis(500));
    /// assert_eq!(config.timeout, Duration::from_millis(500));
    /// ```
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the CPU rack.
    pub fn with_rack(mut self, rack: u8) -> Self {
        self.rack = rack;
        self
    }

    /// Sets the CPU slot.
    pub fn with_slot(mut self, slot: u8) -> Self {
        self.slot = slot;
        self
    }

    /// Sets the data block number.
    pub fn with_db(mut self, db: u16) -> Self {
        self.db = db;
        self
    }

    /// Sets the requested PDU length.
    pub fn with_pdu_length(mut self, pdu_length: u16) -> Self {
        self.pdu_length = pdu_length;
        self
    }
}

/// S7 client for one data block.
///
/// Each read or write chunk produces exactly one request and one response.
/// No automatic retries or caching.
pub struct S7Client {
    config: ClientConfig,
    transport: Option<TcpTransport>,
    pdu_length: u16,
    pdu_ref: u16,
}

impl S7Client {
    /// Creates a disconnected client.
    pub fn new(config: ClientConfig) -> Self {
        let pdu_length = config.pdu_length;
        Self {
            config,
            transport: None,
            pdu_length,
            pdu_ref: 0,
        }
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns the PDU length granted by the PLC (or requested, before connect).
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn next_pdu_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    /// Sends a request and validates the response envelope.
    fn exchange(&mut self, frame: &[u8], pdu_ref: u16) -> Result<S7Response> {
        let transport = self.transport.as_mut().ok_or(PlcError::NotConnected)?;
        let bytes = match transport.send_receive(frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "S7 exchange failed, closing socket");
                self.close();
                return Err(e);
            }
        };
        let response = S7Response::from_bytes(&bytes)?;
        response.check_pdu_ref(pdu_ref)?;
        response.check_error()?;
        Ok(response)
    }

    fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.shutdown();
        }
    }

    fn handshake(&mut self) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(PlcError::NotConnected)?;
        let request = ConnectionRequest::new(self.config.rack, self.config.slot)?;
        let confirm = transport.send_receive(&request.to_bytes())?;
        check_connection_confirm(&confirm)?;

        let pdu_ref = self.next_pdu_ref();
        let setup = SetupCommunication::new(pdu_ref, self.config.pdu_length)?;
        let response = self.exchange(&setup.to_bytes(), pdu_ref)?;
        let granted = response.negotiated_pdu_length()?;
        self.pdu_length = granted.min(self.config.pdu_length);
        Ok(())
    }

    fn max_read_chunk(&self) -> usize {
        (self.pdu_length as usize)
            .saturating_sub(READ_RESPONSE_OVERHEAD)
            .max(1)
    }

    fn max_write_chunk(&self) -> usize {
        (self.pdu_length as usize)
            .saturating_sub(WRITE_REQUEST_OVERHEAD)
            .max(1)
    }
}

impl RegisterTransport for S7Client {
    fn connect(&mut self) -> Result<()> {
        self.close();
        let transport = TcpTransport::connect(self.config.plc_addr, self.config.timeout)
            .map_err(|e| PlcError::connection(format!("{}: {}", self.config.plc_addr, e)))?;
        self.transport = Some(transport);

        if let Err(e) = self.handshake() {
            self.close();
            return Err(match e {
                PlcError::Connection { .. } => e,
                other => PlcError::connection(other.to_string()),
            });
        }
        info!(
            addr = %self.config.plc_addr,
            rack = self.config.rack,
            slot = self.config.slot,
            db = self.config.db,
            pdu_length = self.pdu_length,
            "S7 connection established"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn read_bytes(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(PlcError::invalid_parameter("len", "must be greater than 0"));
        }
        let max_chunk = self.max_read_chunk();
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = (len - out.len()).min(max_chunk);
            let chunk_offset = offset + out.len() as u32;
            let pdu_ref = self.next_pdu_ref();
            let cmd = ReadVarCommand::new(pdu_ref, self.config.db, chunk_offset, chunk as u16)?;
            let data = self.exchange(&cmd.to_bytes(), pdu_ref)?.read_data()?;
            if data.len() != chunk {
                return Err(PlcError::decode(chunk_offset, chunk, data.len()));
            }
            out.extend_from_slice(&data);
        }
        debug!(offset, len, "read DB bytes");
        Ok(out)
    }

    fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(PlcError::invalid_parameter("data", "must not be empty"));
        }
        let max_chunk = self.max_write_chunk();
        for (i, chunk) in data.chunks(max_chunk).enumerate() {
            let chunk_offset = offset + (i * max_chunk) as u32;
            let pdu_ref = self.next_pdu_ref();
            let cmd = WriteVarCommand::new(pdu_ref, self.config.db, chunk_offset, chunk)?;
            self.exchange(&cmd.to_bytes(), pdu_ref)
                .and_then(|response| response.check_write())
                .map_err(|e| match e {
                    PlcError::ItemError { .. } | PlcError::NotConnected => e,
                    other => PlcError::write(chunk_offset, other.to_string()),
                })?;
        }
        debug!(offset, len = data.len(), "wrote DB bytes");
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.transport.is_some() {
            info!(addr = %self.config.plc_addr, "closing S7 connection");
        }
        self.close();
    }
}

impl std::fmt::Debug for S7Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S7Client")
            .field("plc_addr", &self.config.plc_addr)
            .field("db", &self.config.db)
            .field("connected", &self.transport.is_some())
            .field("pdu_length", &self.pdu_length)
            .finish()
    }
}
