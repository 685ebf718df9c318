//! TCP transport layer for ISO-on-TCP communication.
//!
//! This module provides the [`TcpTransport`] struct which handles low-level
//! TCP communication with the PLC. The transport only knows about sockets and
//! TPKT framing: it sends a complete frame and reads back exactly one frame,
//! using the TPKT length to find the frame boundary.
//!
//! # Constants
//!
//! - [`DEFAULT_S7_PORT`] - ISO-on-TCP port (102)
//! - [`DEFAULT_TIMEOUT`] - Default timeout (2 seconds)
//! - [`MAX_FRAME_SIZE`] - Largest frame accepted from the PLC
//!
//! # Example
//!
//! The transport is typically used through [`S7Client`](crate::S7Client):
//!
//! ```no_run
//! use plcwatch::TcpTransport;
//! use std::time::Duration;
//!
//! let mut transport = TcpTransport::connect(
//!     "192.168.58.10:102".parse().unwrap(),
//!     Duration::from_secs(2),
//! ).unwrap();
//!
//! let request = vec![0x03, 0x00, /* ... rest of TPKT frame */];
//! let response = transport.send_receive(&request);
//! ```

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::trace;

use crate::error::{PlcError, Result};
use crate::header::{TpktHeader, TPKT_HEADER_SIZE};

/// Default ISO-on-TCP port.
pub const DEFAULT_S7_PORT: u16 = 102;

/// Default timeout for connect, read and write.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest frame accepted from the PLC.
pub const MAX_FRAME_SIZE: usize = 4096;

/// TCP transport for TPKT frames.
///
/// Handles synchronous communication with configurable timeout.
pub struct TcpTransport {
    stream: TcpStream,
    remote_addr: SocketAddr,
}

impl TcpTransport {
    /// Opens a TCP connection to the PLC.
    ///
    /// # Errors
    ///
    /// Returns `PlcError::Timeout` if the connect times out and `PlcError::Io`
    /// for other socket failures.
    pub fn connect(plc_addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&plc_addr, timeout).map_err(map_io)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            remote_addr: plc_addr,
        })
    }

    /// Sends a complete TPKT frame and receives one response frame.
    ///
    /// This blocks until a full frame is received or the timeout expires.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The send fails
    /// - The receive times out (`PlcError::Timeout`)
    /// - The peer closes the connection or sends a malformed TPKT header
    pub fn send_receive(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        trace!(remote = %self.remote_addr, len = data.len(), "send frame");
        self.stream.write_all(data).map_err(map_io)?;

        let mut header = [0u8; TPKT_HEADER_SIZE];
        self.stream.read_exact(&mut header).map_err(map_io)?;
        let tpkt = TpktHeader::from_bytes(&header)?;
        let total = tpkt.length as usize;
        if total > MAX_FRAME_SIZE {
            return Err(PlcError::invalid_response(format!(
                "frame of {} bytes exceeds {}",
                total, MAX_FRAME_SIZE
            )));
        }

        let mut frame = vec![0u8; total];
        frame[..TPKT_HEADER_SIZE].copy_from_slice(&header);
        self.stream
            .read_exact(&mut frame[TPKT_HEADER_SIZE..])
            .map_err(map_io)?;
        trace!(remote = %self.remote_addr, len = frame.len(), "received frame");
        Ok(frame)
    }

    /// Returns the remote PLC address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Shuts down both directions of the socket.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn map_io(err: std::io::Error) -> PlcError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => PlcError::Timeout,
        _ => PlcError::Io(err),
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.stream.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_S7_PORT, 102);
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(2));
    }

    #[test]
    fn test_send_receive_reads_one_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 7];
            socket.read_exact(&mut request).unwrap();
            // echo the frame back, followed by trailing garbage the client must not consume
            socket.write_all(&request).unwrap();
            socket.write_all(&[0xEE]).unwrap();
        });

        let mut transport = TcpTransport::connect(addr, Duration::from_secs(1)).unwrap();
        let frame = hex::decode("0300000702f080").unwrap();
        let response = transport.send_receive(&frame).unwrap();
        assert_eq!(response, frame);
        server.join().unwrap();
    }

    #[test]
    fn test_receive_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(socket);
        });

        let mut transport = TcpTransport::connect(addr, Duration::from_millis(50)).unwrap();
        let err = transport.send_receive(&[0x03, 0x00, 0x00, 0x04]).unwrap_err();
        assert!(matches!(err, PlcError::Timeout));
        server.join().unwrap();
    }

    #[test]
    fn test_transport_debug() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = TcpTransport::connect(addr, Duration::from_millis(100)).unwrap();
        let debug_str = format!("{:?}", transport);
        assert!(debug_str.contains("TcpTransport"));
        assert!(debug_str.contains(&addr.to_string()));
    }
}
