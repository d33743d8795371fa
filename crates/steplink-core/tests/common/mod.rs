//! Scripted in-memory peer shared by the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use steplink_core::config::ConnectionConfig;
use steplink_core::protocol::{encode, Boot, Connection, ControlCodes, SerialDevice};

pub const ACK: u8 = 0x80;
pub const NACK: u8 = 0x81;
pub const WAIT: u8 = 0x82;
pub const STALL: u8 = 0x83;
pub const RESET: u8 = 0x84;
pub const STARTUP: u8 = 0x85;
pub const ACK_RESET: u8 = 0x86;
pub const DEBUG: u8 = 0x87;
pub const ID: u8 = 0x88;

pub const MOVE_COMPLETE: u8 = 0x60;
pub const TEMP_ALARM: u8 = 0x61;
pub const FLOW_CONTINUE: u8 = 0x62;
pub const LIMIT_HIT: u8 = 0x63;
pub const MESSAGE: u8 = 0x64;
pub const PONG: u8 = 0x65;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Mock device: every write except the host's own ACK/NACK bytes pulls the
/// next scripted response (or asks the responder) and queues it for reading.
/// Reads never block; an empty read stands for a timeout.
pub struct ScriptedDevice {
    inbound: VecDeque<u8>,
    responses: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    pub writes: Vec<Vec<u8>>,
    pub dtr: Vec<bool>,
    pub fail_on_write: bool,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self {
            inbound: VecDeque::new(),
            responses: VecDeque::new(),
            responder: None,
            writes: Vec::new(),
            dtr: Vec::new(),
            fail_on_write: false,
        }
    }

    /// Queue the peer's reaction to the next frame/probe/reset write
    pub fn respond(mut self, bytes: &[u8]) -> Self {
        self.responses.push_back(bytes.to_vec());
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn queue_response(&mut self, bytes: &[u8]) {
        self.responses.push_back(bytes.to_vec());
    }

    /// Make bytes readable right away
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Writes that were frames (length byte below 0x80)
    pub fn frame_writes(&self) -> Vec<Vec<u8>> {
        self.writes
            .iter()
            .filter(|w| w.first().map_or(false, |b| b & 0x80 == 0))
            .cloned()
            .collect()
    }

    /// Count single-byte control writes equal to `code`
    pub fn control_writes(&self, code: u8) -> usize {
        self.writes.iter().filter(|w| w.as_slice() == [code]).count()
    }

    pub fn pending_input(&self) -> usize {
        self.inbound.len()
    }
}

impl SerialDevice for ScriptedDevice {
    fn read(&mut self, max: usize, _timeout: Duration) -> io::Result<Vec<u8>> {
        let n = max.min(self.inbound.len());
        Ok(self.inbound.drain(..n).collect())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.fail_on_write {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "serial write failed"));
        }
        self.writes.push(data.to_vec());
        if data == [ACK] || data == [NACK] {
            return Ok(());
        }
        let response = match self.responder.as_mut() {
            Some(responder) => responder(data),
            None => self.responses.pop_front().unwrap_or_default(),
        };
        self.inbound.extend(response);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.dtr.push(level);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.inbound.clear();
        Ok(())
    }
}

pub fn frame(flag: bool, opcode: u8, payload: &[u8]) -> Vec<u8> {
    encode(flag, opcode, payload).unwrap()
}

pub fn test_config() -> ConnectionConfig {
    let config = ConnectionConfig {
        max_retries: 3,
        max_probe_attempts: 4,
        flow_resume_polls: 5,
        garbage_limit: 8,
        ..ConnectionConfig::default()
    };
    assert_eq!(config.codes, ControlCodes::default());
    config
}

/// Connection that went through a cold-boot handshake, with the write log cleared
pub fn connected(device: ScriptedDevice) -> Connection<ScriptedDevice> {
    connected_with(device, test_config())
}

pub fn connected_with(
    device: ScriptedDevice,
    config: ConnectionConfig,
) -> Connection<ScriptedDevice> {
    let mut device = device;
    // The probe is the first write; the device answers with a cold boot
    device.responses.push_front(vec![STARTUP]);
    let mut conn = Connection::with_device(device, config).unwrap();
    assert_eq!(conn.handshake().unwrap(), Boot::Cold);
    conn.device_mut().unwrap().clear_writes();
    conn
}

pub fn device(conn: &Connection<ScriptedDevice>) -> &ScriptedDevice {
    conn.device().unwrap()
}

pub fn device_mut(conn: &mut Connection<ScriptedDevice>) -> &mut ScriptedDevice {
    conn.device_mut().unwrap()
}
