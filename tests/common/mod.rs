//! In-process EtherNet/IP controller for integration tests.
//!
//! Serves RegisterSession, UnRegisterSession, NOP and SendRRData carrying
//! Read Tag, Write Tag or an Unconnected Send around either. Tags live in a
//! table keyed by their canonical address.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use enip::codec::{
    self, TYPE_BOOL, TYPE_DINT, TYPE_INT, TYPE_LINT, TYPE_LREAL, TYPE_REAL, TYPE_SINT,
};
use enip::{
    extract_cip, send_rr_data, EncapsulationHeader, Float, SignedInt, TaggedValue, WireType,
    COMMAND_NOP, COMMAND_REGISTER_SESSION, COMMAND_SEND_RR_DATA, COMMAND_UNREGISTER_SESSION,
    ENCAPSULATION_HEADER_SIZE, SERVICE_READ_TAG, SERVICE_WRITE_TAG,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const SESSION_HANDLE: u32 = 0x1A2B_3C4D;

const SERVICE_UNCONNECTED_SEND: u8 = 0x52;

#[derive(Default)]
struct State {
    tags: HashMap<String, (WireType, Vec<u8>)>,
    failures: HashMap<String, (u8, Vec<u16>)>,
    drop_on: Option<String>,
    writes: Vec<(String, Vec<u8>)>,
    reads: HashMap<String, usize>,
    delays: HashMap<String, Duration>,
    log: Vec<String>,
    nops: usize,
    routed: usize,
    unregistered: usize,
}

/// A mock controller listening on localhost.
pub struct MockPlc {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl MockPlc {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&shared)));
            }
        });

        Self { addr, state, task }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Stores an atomic or text value under `address`.
    pub fn set(&self, address: &str, value: impl Into<TaggedValue>) {
        let value = value.into();
        let wire = wire_type_of(&value);
        self.set_raw(address, wire, codec::encode(&value).unwrap());
    }

    pub fn set_raw(&self, address: &str, wire: WireType, data: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .tags
            .insert(address.to_string(), (wire, data));
    }

    pub fn raw(&self, address: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(address)
            .map(|(_, data)| data.clone())
    }

    /// Answers every request for `address` with a CIP error status.
    pub fn fail(&self, address: &str, status: u8, extended: &[u16]) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(address.to_string(), (status, extended.to_vec()));
    }

    /// Closes the connection instead of answering a request for `address`.
    pub fn drop_on(&self, address: &str) {
        self.state.lock().unwrap().drop_on = Some(address.to_string());
    }

    /// Holds every reply for `address` back for `delay`.
    pub fn delay(&self, address: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(address.to_string(), delay);
    }

    /// Replies sent and sessions unregistered, in order.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn reads(&self, address: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .reads
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn nops(&self) -> usize {
        self.state.lock().unwrap().nops
    }

    pub fn routed(&self) -> usize {
        self.state.lock().unwrap().routed
    }

    pub fn unregistered(&self) -> usize {
        self.state.lock().unwrap().unregistered
    }

    /// Polls `check` until it holds or two seconds pass.
    pub async fn wait_for(&self, check: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..200 {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }
}

impl Drop for MockPlc {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn wire_type_of(value: &TaggedValue) -> WireType {
    match value {
        TaggedValue::Bool(_) => WireType::Atomic(TYPE_BOOL),
        TaggedValue::SignedInt(SignedInt::Sint(_)) => WireType::Atomic(TYPE_SINT),
        TaggedValue::SignedInt(SignedInt::Int(_)) => WireType::Atomic(TYPE_INT),
        TaggedValue::SignedInt(SignedInt::Dint(_)) => WireType::Atomic(TYPE_DINT),
        TaggedValue::SignedInt(SignedInt::Lint(_)) => WireType::Atomic(TYPE_LINT),
        TaggedValue::Float(Float::Real(_)) => WireType::Atomic(TYPE_REAL),
        TaggedValue::Float(Float::Lreal(_)) => WireType::Atomic(TYPE_LREAL),
        TaggedValue::Text(_) => WireType::Structure(codec::STRING_HANDLE),
        TaggedValue::Composite(_) => panic!("use set_raw for structures"),
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) {
    loop {
        let mut head = [0u8; ENCAPSULATION_HEADER_SIZE];
        if stream.read_exact(&mut head).await.is_err() {
            return;
        }
        let header = EncapsulationHeader::from_bytes(&head).unwrap();
        let mut data = vec![0u8; usize::from(header.length)];
        if stream.read_exact(&mut data).await.is_err() {
            return;
        }

        let reply = match header.command {
            COMMAND_REGISTER_SESSION => (SESSION_HANDLE, data),
            COMMAND_NOP => {
                state.lock().unwrap().nops += 1;
                continue;
            }
            COMMAND_UNREGISTER_SESSION => {
                let mut state = state.lock().unwrap();
                state.unregistered += 1;
                state.log.push("unregister".to_string());
                return;
            }
            COMMAND_SEND_RR_DATA => {
                let request = extract_cip(&data).unwrap();
                let Some((cip, address)) = handle_cip(&state, &request) else {
                    return;
                };
                let delay = state.lock().unwrap().delays.get(&address).copied();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                state.lock().unwrap().log.push(format!("reply {address}"));
                (header.session_handle, send_rr_data(&cip))
            }
            other => panic!("unexpected command 0x{other:04X}"),
        };

        let (handle, body) = reply;
        let length = body.len() as u16;
        let out = EncapsulationHeader::new(header.command, handle, length, header.sender_context);
        let mut bytes = out.to_bytes().to_vec();
        bytes.extend_from_slice(&body);
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

/// Returns the CIP reply and the tag it concerns, or `None` to drop the
/// connection.
fn handle_cip(state: &Mutex<State>, request: &[u8]) -> Option<(Vec<u8>, String)> {
    let service = request[0];
    if service == SERVICE_UNCONNECTED_SEND {
        state.lock().unwrap().routed += 1;
        let path_len = usize::from(request[1]) * 2;
        let pos = 2 + path_len + 2;
        let len = usize::from(u16::from_le_bytes([request[pos], request[pos + 1]]));
        return handle_cip(state, &request[pos + 2..pos + 2 + len]);
    }

    let path_len = usize::from(request[1]) * 2;
    let address = parse_path(&request[2..2 + path_len]);
    let rest = &request[2 + path_len..];
    let reply = reply_for(&mut state.lock().unwrap(), service, &address, rest)?;
    Some((reply, address))
}

fn reply_for(state: &mut State, service: u8, address: &str, rest: &[u8]) -> Option<Vec<u8>> {
    let reply_service = service | 0x80;

    if state.drop_on.as_deref() == Some(address) {
        return None;
    }
    if let Some((status, extended)) = state.failures.get(address) {
        let mut reply = vec![reply_service, 0, *status, extended.len() as u8];
        for word in extended {
            reply.extend_from_slice(&word.to_le_bytes());
        }
        return Some(reply);
    }

    let not_found = vec![reply_service, 0, 0x05, 0];
    match service {
        SERVICE_READ_TAG => {
            *state.reads.entry(address.to_string()).or_default() += 1;
            let Some((wire, data)) = state.tags.get(address) else {
                return Some(not_found);
            };
            let mut reply = vec![reply_service, 0, 0, 0];
            reply.extend_from_slice(&wire.to_bytes());
            reply.extend_from_slice(data);
            Some(reply)
        }
        SERVICE_WRITE_TAG => {
            let (wire, used) = WireType::parse(rest).unwrap();
            // element count
            let data = rest[used + 2..].to_vec();
            let Some((native, _)) = state.tags.get(address) else {
                return Some(not_found);
            };
            if *native != wire {
                return Some(vec![reply_service, 0, 0xFF, 1, 0x07, 0x21]);
            }
            state.tags.insert(address.to_string(), (wire, data.clone()));
            state.writes.push((address.to_string(), data));
            Some(vec![reply_service, 0, 0, 0])
        }
        _ => Some(vec![reply_service, 0, 0x08, 0]),
    }
}

/// Renders a request path back into `Name.Member[1,2]` form.
fn parse_path(path: &[u8]) -> String {
    let mut out = String::new();
    let mut indices: Vec<u32> = Vec::new();
    let mut pos = 0;

    let flush = |out: &mut String, indices: &mut Vec<u32>| {
        if !indices.is_empty() {
            let list: Vec<String> = indices.iter().map(u32::to_string).collect();
            out.push_str(&format!("[{}]", list.join(",")));
            indices.clear();
        }
    };

    while pos < path.len() {
        match path[pos] {
            0x91 => {
                flush(&mut out, &mut indices);
                let len = usize::from(path[pos + 1]);
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(std::str::from_utf8(&path[pos + 2..pos + 2 + len]).unwrap());
                pos += 2 + len + len % 2;
            }
            0x28 => {
                indices.push(u32::from(path[pos + 1]));
                pos += 2;
            }
            0x29 => {
                indices.push(u32::from(u16::from_le_bytes([path[pos + 2], path[pos + 3]])));
                pos += 4;
            }
            0x2A => {
                indices.push(u32::from_le_bytes([
                    path[pos + 2],
                    path[pos + 3],
                    path[pos + 4],
                    path[pos + 5],
                ]));
                pos += 6;
            }
            other => panic!("unexpected path segment 0x{other:02X}"),
        }
    }
    flush(&mut out, &mut indices);
    out
}
