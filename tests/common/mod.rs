//! Scripted in-memory server for driving `Connection` without a socket.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use qail_mysqlclient::{Connection, ConnectionParams, MySqlError, MySqlResult, Transport};

pub const SCRAMBLE: &[u8] = b"abcdefghijklmnopqrst";

pub const SERVER_CAPS: u32 = 0x0000_0001 // LONG_PASSWORD
    | 0x0000_0004 // LONG_FLAG
    | 0x0000_0008 // CONNECT_WITH_DB
    | 0x0000_0200 // PROTOCOL_41
    | 0x0000_2000 // TRANSACTIONS
    | 0x0000_8000 // SECURE_CONNECTION
    | 0x0002_0000 // MULTI_RESULTS
    | 0x0008_0000; // PLUGIN_AUTH

pub const CLIENT_SSL: u32 = 0x0000_0800;

/// Replays canned server payloads and records what the client writes.
///
/// Sequence ids follow the protocol: the first reply after a client frame
/// with id `n` carries `n + 1`.
pub struct MockTransport {
    replies: VecDeque<Vec<u8>>,
    next_seq: u8,
    log: Script,
}

/// Shared view of a [`MockTransport`] that stays usable after the transport
/// is boxed into a connection.
#[derive(Clone, Default)]
pub struct Script {
    writes: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl Script {
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn last_write(&self) -> Option<(u8, Vec<u8>)> {
        self.writes.lock().unwrap().last().cloned()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl MockTransport {
    pub fn new(replies: Vec<Vec<u8>>) -> (Self, Script) {
        let log = Script::default();
        let transport = Self {
            replies: replies.into(),
            next_seq: 0,
            log: log.clone(),
        };
        (transport, log)
    }
}

impl Transport for MockTransport {
    fn write_frame(&mut self, sequence_id: u8, payload: &[u8]) -> MySqlResult<()> {
        self.log
            .writes
            .lock()
            .unwrap()
            .push((sequence_id, payload.to_vec()));
        self.next_seq = sequence_id.wrapping_add(1);
        Ok(())
    }

    fn read_frame(&mut self) -> MySqlResult<(u8, Vec<u8>)> {
        let payload = self.replies.pop_front().ok_or_else(|| {
            MySqlError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Lost connection to MySQL server during query",
            ))
        })?;
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        Ok((seq, payload))
    }

    fn shutdown(&mut self) {
        self.log.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Route driver logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn params() -> ConnectionParams {
    ConnectionParams::builder()
        .host("mock")
        .port(3306)
        .user("root")
        .password("secret")
        .database("test")
        .build()
        .unwrap()
}

/// Connect through a mock that greets with `mysql_native_password`, accepts
/// the login, then replays `replies`.
pub fn connect(replies: Vec<Vec<u8>>) -> (Connection, Script) {
    connect_with_status(0x0002, replies)
}

/// Like [`connect`], with the given status flags in the login OK packet.
pub fn connect_with_status(status: u16, replies: Vec<Vec<u8>>) -> (Connection, Script) {
    init_tracing();
    let mut script = vec![handshake("mysql_native_password", SERVER_CAPS), ok(0, 0, status)];
    script.extend(replies);
    let (transport, log) = MockTransport::new(script);
    let conn = Connection::connect_with_transport(&params(), Box::new(transport)).unwrap();
    (conn, log)
}

fn put_lenenc(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=250 => buf.push(n as u8),
        251..=0xffff => {
            buf.push(0xfc);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xff_ffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u32).to_le_bytes()[..3]);
        }
        _ => {
            buf.push(0xfe);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn put_lenenc_str(buf: &mut Vec<u8>, s: &[u8]) {
    put_lenenc(buf, s.len() as u64);
    buf.extend_from_slice(s);
}

/// Protocol 10 greeting.
pub fn handshake(plugin: &str, caps: u32) -> Vec<u8> {
    let mut p = vec![10];
    p.extend_from_slice(b"8.0.36\0");
    p.extend_from_slice(&42u32.to_le_bytes());
    p.extend_from_slice(&SCRAMBLE[..8]);
    p.push(0);
    p.extend_from_slice(&(caps as u16).to_le_bytes());
    p.push(45);
    p.extend_from_slice(&0x0002u16.to_le_bytes());
    p.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    p.push(21);
    p.extend_from_slice(&[0u8; 10]);
    p.extend_from_slice(&SCRAMBLE[8..]);
    p.push(0);
    p.extend_from_slice(plugin.as_bytes());
    p.push(0);
    p
}

pub fn ok(affected_rows: u64, last_insert_id: u64, status: u16) -> Vec<u8> {
    let mut p = vec![0x00];
    put_lenenc(&mut p, affected_rows);
    put_lenenc(&mut p, last_insert_id);
    p.extend_from_slice(&status.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes());
    p
}

pub fn err(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut p = vec![0xff];
    p.extend_from_slice(&code.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(sql_state.as_bytes());
    p.extend_from_slice(message.as_bytes());
    p
}

pub fn eof(status: u16) -> Vec<u8> {
    let mut p = vec![0xfe, 0, 0];
    p.extend_from_slice(&status.to_le_bytes());
    p
}

pub fn column_def(name: &str) -> Vec<u8> {
    let mut p = Vec::new();
    put_lenenc_str(&mut p, b"def");
    put_lenenc_str(&mut p, b"test");
    put_lenenc_str(&mut p, b"t");
    put_lenenc_str(&mut p, b"t");
    put_lenenc_str(&mut p, name.as_bytes());
    put_lenenc_str(&mut p, name.as_bytes());
    p.push(0x0c);
    p.extend_from_slice(&45u16.to_le_bytes());
    p.extend_from_slice(&255u32.to_le_bytes());
    p.push(0xfd);
    p.extend_from_slice(&0u16.to_le_bytes());
    p.push(0);
    p.extend_from_slice(&[0, 0]);
    p
}

pub fn row(values: &[Option<&[u8]>]) -> Vec<u8> {
    let mut p = Vec::new();
    for value in values {
        match value {
            Some(v) => put_lenenc_str(&mut p, v),
            None => p.push(0xfb),
        }
    }
    p
}

/// Packets of a complete text result set, ending with `status` in the EOF.
pub fn result_set(columns: &[&str], rows: &[Vec<Option<&[u8]>>], status: u16) -> Vec<Vec<u8>> {
    let mut packets = vec![vec![columns.len() as u8]];
    packets.extend(columns.iter().map(|c| column_def(c)));
    packets.push(eof(0x0002));
    packets.extend(rows.iter().map(|r| row(r)));
    packets.push(eof(status));
    packets
}
