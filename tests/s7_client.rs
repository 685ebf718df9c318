//! S7 client against an in-process fake PLC speaking ISO-on-TCP.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use plcwatch::codec::encode_float;
use plcwatch::event::EventSender;
use plcwatch::{
    ClientConfig, DeviceLink, EngineConfig, PlcError, PollingEngine, RegisterMap,
    RegisterTransport, S7Client, SignalId,
};

/// Connection request for rack 0, slot 1.
const CONNECT_REQUEST: &str = "0300001611e00000000100c0010ac1020100c2020101";
const CONNECT_CONFIRM: &str = "0300000b06d00001000100";

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Normal,
    MuteReads,
}

struct FakePlc {
    addr: SocketAddr,
    memory: Arc<Mutex<Vec<u8>>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakePlc {
    fn spawn(granted_pdu: u16, mode: Mode) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let memory = Arc::new(Mutex::new(vec![0u8; 2048]));
        let requests = Arc::new(Mutex::new(Vec::new()));
        {
            let memory = Arc::clone(&memory);
            let requests = Arc::clone(&requests);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { return };
                    serve(stream, &memory, &requests, granted_pdu, mode);
                }
            });
        }
        Self {
            addr,
            memory,
            requests,
        }
    }

    fn client(&self) -> S7Client {
        S7Client::new(
            ClientConfig::new(Ipv4Addr::LOCALHOST)
                .with_port(self.addr.port())
                .with_timeout(Duration::from_millis(300)),
        )
    }

    fn requests_with_function(&self, function: u8) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|f| f.len() > 17 && f[5] == 0xF0 && f[17] == function)
            .count()
    }
}

fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).ok()?;
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut frame = vec![0u8; total];
    frame[..4].copy_from_slice(&header);
    stream.read_exact(&mut frame[4..]).ok()?;
    Some(frame)
}

fn ack_data(pdu_ref: [u8; 2], params: &[u8], data: &[u8]) -> Vec<u8> {
    let total = 4 + 3 + 12 + params.len() + data.len();
    let mut frame = vec![0x03, 0x00];
    frame.extend_from_slice(&(total as u16).to_be_bytes());
    frame.extend_from_slice(&[0x02, 0xF0, 0x80]);
    frame.extend_from_slice(&[0x32, 0x03, 0x00, 0x00, pdu_ref[0], pdu_ref[1]]);
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}

fn serve(
    mut stream: TcpStream,
    memory: &Mutex<Vec<u8>>,
    requests: &Mutex<Vec<Vec<u8>>>,
    granted_pdu: u16,
    mode: Mode,
) {
    while let Some(frame) = read_frame(&mut stream) {
        requests.lock().push(frame.clone());
        if frame[5] == 0xE0 {
            let _ = stream.write_all(&hex::decode(CONNECT_CONFIRM).unwrap());
            continue;
        }

        let pdu_ref = [frame[11], frame[12]];
        let reply = match frame[17] {
            0xF0 => {
                let pdu = granted_pdu.to_be_bytes();
                ack_data(
                    pdu_ref,
                    &[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, pdu[0], pdu[1]],
                    &[],
                )
            }
            0x04 => {
                if mode == Mode::MuteReads {
                    continue;
                }
                let len = u16::from_be_bytes([frame[23], frame[24]]) as usize;
                let offset = (u32::from_be_bytes([0, frame[28], frame[29], frame[30]]) >> 3) as usize;
                let memory = memory.lock();
                let data = match memory.get(offset..offset + len) {
                    Some(bytes) => {
                        let mut item = vec![0xFF, 0x04];
                        item.extend_from_slice(&((len * 8) as u16).to_be_bytes());
                        item.extend_from_slice(bytes);
                        item
                    }
                    None => vec![0x0A, 0x00, 0x00, 0x00],
                };
                ack_data(pdu_ref, &[0x04, 0x01], &data)
            }
            0x05 => {
                let len = u16::from_be_bytes([frame[23], frame[24]]) as usize;
                let offset = (u32::from_be_bytes([0, frame[28], frame[29], frame[30]]) >> 3) as usize;
                let mut memory = memory.lock();
                let code = match memory.get_mut(offset..offset + len) {
                    Some(target) => {
                        target.copy_from_slice(&frame[35..35 + len]);
                        0xFF
                    }
                    None => 0x0A,
                };
                ack_data(pdu_ref, &[0x05, 0x01], &[code])
            }
            _ => return,
        };
        if stream.write_all(&reply).is_err() {
            return;
        }
    }
}

#[test]
fn test_connect_negotiates_pdu_length() {
    let plc = FakePlc::spawn(240, Mode::Normal);
    let mut client = plc.client();
    client.connect().unwrap();
    assert!(client.is_connected());
    assert_eq!(client.pdu_length(), 240);

    let first = plc.requests.lock()[0].clone();
    assert_eq!(hex::encode(first), CONNECT_REQUEST);
    assert_eq!(plc.requests_with_function(0xF0), 1);

    client.disconnect();
    assert!(!client.is_connected());
}

#[test]
fn test_large_read_is_chunked() {
    let plc = FakePlc::spawn(240, Mode::Normal);
    for (i, byte) in plc.memory.lock().iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let mut client = plc.client();
    client.connect().unwrap();

    // 240 - 18 bytes of overhead leaves 222 per chunk
    let data = client.read_bytes(100, 500).unwrap();
    assert_eq!(data.len(), 500);
    assert_eq!(data[0], 100);
    assert_eq!(data[499], (599 % 251) as u8);
    assert_eq!(plc.requests_with_function(0x04), 3);
}

#[test]
fn test_write_reaches_memory() {
    let plc = FakePlc::spawn(480, Mode::Normal);
    let mut client = plc.client();
    client.connect().unwrap();

    client.write_bytes(750, &[0x81, 0x02]).unwrap();
    assert_eq!(&plc.memory.lock()[750..752], &[0x81, 0x02]);
    assert_eq!(client.read_bytes(750, 2).unwrap(), vec![0x81, 0x02]);
}

#[test]
fn test_item_error_is_reported() {
    let plc = FakePlc::spawn(480, Mode::Normal);
    let mut client = plc.client();
    client.connect().unwrap();

    let err = client.read_bytes(2040, 16).unwrap_err();
    assert!(matches!(err, PlcError::ItemError { return_code: 0x0A }));
    // item errors keep the connection
    assert!(client.is_connected());
}

#[test]
fn test_read_timeout_closes_connection() {
    let plc = FakePlc::spawn(480, Mode::MuteReads);
    let mut client = plc.client();
    client.connect().unwrap();

    let err = client.read_bytes(0, 4).unwrap_err();
    assert!(matches!(err, PlcError::Timeout));
    assert!(err.is_transient());
    assert!(!client.is_connected());
}

#[test]
fn test_connect_refused() {
    let addr = {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap()
    };
    let mut client = S7Client::new(
        ClientConfig::new(Ipv4Addr::LOCALHOST)
            .with_port(addr.port())
            .with_timeout(Duration::from_millis(300)),
    );
    assert!(matches!(client.connect(), Err(PlcError::Connection { .. })));
    assert!(!client.is_connected());
}

#[test]
fn test_engine_over_s7() {
    let plc = FakePlc::spawn(480, Mode::Normal);
    {
        let mut memory = plc.memory.lock();
        memory[750] = 0b0000_0001;
        memory[1011] = 3;
        memory[1200..1204].copy_from_slice(&encode_float(-42.25));
    }

    let link = Arc::new(DeviceLink::new(plc.client()));
    let mut engine = PollingEngine::new(
        Arc::clone(&link),
        &RegisterMap::default(),
        EngineConfig::default(),
        EventSender::discard(),
    );

    // the engine connects a disconnected link at cycle start
    let snapshot = engine.poll_once().unwrap();
    assert!(link.is_connected());
    assert_eq!(snapshot.bit(&SignalId::bit(750, 0).unwrap()), Some(true));
    assert_eq!(snapshot.bit(&SignalId::bit(750, 1).unwrap()), Some(false));
    assert_eq!(snapshot.byte(&SignalId::byte(1011)), Some(3));
    assert_eq!(snapshot.float(&SignalId::float(1200)), Some(-42.25));

    link.write_bit(750, 7, true).unwrap();
    assert_eq!(plc.memory.lock()[750], 0b1000_0001);
    link.disconnect();
}
