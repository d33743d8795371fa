//! Connection management
//!
//! Owns the serial device and the link state, and runs the stop-and-wait ARQ:
//! every outbound frame waits for its ACK before the next one is composed,
//! and every inbound frame is acknowledged, deduplicated by its sequence
//! flag, then classified.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::{
    codec,
    events::{classify, Classified, PendingNotification, WaiterId, WaiterRegistry},
    handshake::HandshakeState,
    serial::{clear_buffers, configure_port, open_port},
    ControlCode, Frame, LinkState, LinkStats, Notification, SerialChannel, SerialDevice,
    TransportError, MAX_PAYLOAD,
};
use crate::config::ConnectionConfig;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device attached
    Disconnected,
    /// Boot handshake in progress
    Probing,
    /// Both sequence flags agreed; calls allowed
    Synchronized,
    /// Torn down after a fatal error
    Error,
}

/// How the device accepted a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// ACK: accepted
    Accepted,
    /// WAIT: accepted into a full queue; later sends wait for FlowContinue
    Queued,
}

/// A reply frame returned to the caller of [`Connection::call_reply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// One unit read off the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Inbound {
    /// Nothing arrived before the timeout
    Idle,
    /// A control byte the caller must act on
    Control(ControlCode),
    /// A frame, debug line or noise, fully processed
    Handled,
}

/// Firmware connection over a byte-stream device
pub struct Connection<D: SerialDevice = SerialChannel> {
    pub(super) device: Option<D>,
    pub(super) config: ConnectionConfig,
    pub(super) state: ConnectionState,
    pub(super) handshake_state: HandshakeState,
    pub(super) link: LinkState,
    pub(super) waiters: WaiterRegistry,
    /// Reply frame received for the outstanding call
    pub(super) reply: Option<Frame>,
    /// Whether a reply frame is currently acceptable
    pub(super) awaiting_reply: bool,
    /// Consecutive unrecognized bytes
    garbage_run: usize,
    pub(super) stats: LinkStats,
}

impl Connection<SerialChannel> {
    /// Open the configured serial port and run the boot handshake
    pub fn open(config: ConnectionConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let mut port = open_port(&config.port_name, Some(config.baud_rate))?;
        configure_port(port.as_mut())?;
        clear_buffers(port.as_mut())?;
        info!(port = %config.port_name, baud = config.baud_rate, "serial port open");

        let reset_on_open = config.reset_on_open;
        let mut conn = Self::with_device(SerialChannel::new(port), config)?;
        if reset_on_open {
            conn.hard_reset()?;
        } else {
            conn.handshake()?;
        }
        Ok(conn)
    }
}

impl<D: SerialDevice> Connection<D> {
    /// Wrap an already open device. The link stays `Disconnected` until
    /// [`handshake`](Self::handshake) succeeds.
    pub fn with_device(device: D, config: ConnectionConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            device: Some(device),
            config,
            state: ConnectionState::Disconnected,
            handshake_state: HandshakeState::default(),
            link: LinkState::new(),
            waiters: WaiterRegistry::new(),
            reply: None,
            awaiting_reply: false,
            garbage_run: 0,
            stats: LinkStats::default(),
        })
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current link state (flags, counters, alarms, limits)
    pub fn link(&self) -> &LinkState {
        &self.link
    }

    /// Cumulative traffic counters
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// The underlying device, while attached
    pub fn device(&self) -> Option<&D> {
        self.device.as_ref()
    }

    pub fn device_mut(&mut self) -> Option<&mut D> {
        self.device.as_mut()
    }

    /// Detach the device; pending waiters fail with `LinkClosed`
    pub fn disconnect(&mut self) -> Option<D> {
        self.waiters.fail_all(|| TransportError::LinkClosed);
        self.link.reset();
        self.reply = None;
        self.awaiting_reply = false;
        self.state = ConnectionState::Disconnected;
        self.handshake_state = HandshakeState::default();
        self.device.take()
    }

    pub fn is_flow_blocked(&self) -> bool {
        self.link.flow_blocked
    }

    pub fn outstanding_moves(&self) -> u32 {
        self.link.outstanding_move_acks
    }

    /// Mark a temperature channel as having an armed alarm
    pub fn arm_temp_alarm(&mut self, channel: u8) {
        self.link.triggered_alarms.remove(&channel);
        self.link.pending_alarm_channels.insert(channel);
    }

    /// Consume a fired alarm; returns whether it had fired
    pub fn take_triggered_alarm(&mut self, channel: u8) -> bool {
        self.link.triggered_alarms.remove(&channel)
    }

    /// Last position reported by a limit switch
    pub fn recorded_limit(&self, space: u8, motor: u8) -> Option<i32> {
        self.link.recorded_limits.get(&(space, motor)).copied()
    }

    pub fn clear_limits(&mut self) {
        self.link.recorded_limits.clear();
    }

    /// Register a one-shot callback fired on the first notification matching
    /// `predicate`, in wire-arrival order. If the link resets or closes
    /// first, the callback receives the error instead.
    pub fn register_notification_waiter<P, F>(&mut self, predicate: P, callback: F) -> WaiterId
    where
        P: Fn(&Notification) -> bool + Send + 'static,
        F: FnOnce(Result<Notification, TransportError>) + Send + 'static,
    {
        self.waiters.register(predicate, callback)
    }

    /// Like [`register_notification_waiter`](Self::register_notification_waiter),
    /// returning a future resolved with the notification
    pub fn wait_for<P>(&mut self, predicate: P) -> PendingNotification
    where
        P: Fn(&Notification) -> bool + Send + 'static,
    {
        self.waiters.wait_for(predicate)
    }

    pub fn cancel_waiter(&mut self, id: WaiterId) -> bool {
        self.waiters.cancel(id)
    }

    /// Send one frame and wait for the device to accept it.
    ///
    /// For commands without a reply. A reply frame arriving during the wait
    /// is a protocol desync; use [`call`](Self::call) for commands that
    /// answer.
    pub fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<Delivery, TransportError> {
        self.ensure_ready()?;
        check_payload(payload)?;
        let result = self.send_frame(opcode, payload);
        self.settle(result)
    }

    /// Synchronous command: send and return the reply payload.
    ///
    /// Requests with a configured reply opcode wait for that reply and fail
    /// with `UnexpectedReply` if a different one arrives; other requests
    /// return an empty payload once acknowledged.
    pub fn call(&mut self, opcode: u8, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let expected = self.config.opcodes.reply_for(opcode);
        match expected {
            Some(expected) => self.call_reply(opcode, payload, expected).map(|r| r.payload),
            None => self.send(opcode, payload).map(|_| Vec::new()),
        }
    }

    /// Send a request and wait for a reply with opcode `expected`
    pub fn call_reply(
        &mut self,
        opcode: u8,
        payload: &[u8],
        expected: u8,
    ) -> Result<Reply, TransportError> {
        self.ensure_ready()?;
        check_payload(payload)?;
        self.reply = None;
        self.awaiting_reply = true;
        let result = self
            .send_frame(opcode, payload)
            .and_then(|_| self.await_reply())
            .and_then(|frame| {
                if frame.opcode == expected {
                    Ok(Reply {
                        opcode: frame.opcode,
                        payload: frame.payload,
                    })
                } else {
                    Err(TransportError::UnexpectedReply {
                        expected,
                        actual: frame.opcode,
                    })
                }
            });
        self.awaiting_reply = false;
        self.reply = None;
        self.settle(result)
    }

    /// Queue a command whose completion is reported later by a
    /// MoveComplete notification
    pub fn call_queued(&mut self, opcode: u8, payload: &[u8]) -> Result<(), TransportError> {
        self.ensure_ready()?;
        check_payload(payload)?;
        // Counted before sending: the completion may overtake a lost ACK
        self.link.outstanding_move_acks = self.link.outstanding_move_acks.saturating_add(1);
        let result = self.send_frame(opcode, payload);
        if result.is_err() && self.state == ConnectionState::Synchronized {
            self.link.outstanding_move_acks = self.link.outstanding_move_acks.saturating_sub(1);
        }
        self.settle(result).map(|_| ())
    }

    /// Process at most one inbound unit; returns whether anything arrived
    pub fn poll(&mut self) -> Result<bool, TransportError> {
        self.ensure_ready()?;
        let result = self.poll_once();
        self.settle(result)
    }

    /// Poll until a notification matching `predicate` arrives, or until
    /// `max_polls` idle periods pass
    pub fn poll_until<P>(
        &mut self,
        predicate: P,
        max_polls: u32,
    ) -> Result<Option<Notification>, TransportError>
    where
        P: Fn(&Notification) -> bool + Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let id = self.waiters.register(predicate, move |result| {
            let _ = tx.send(result);
        });

        let mut idle = 0;
        loop {
            if let Ok(result) = rx.try_recv() {
                return result.map(Some);
            }
            if idle >= max_polls {
                self.waiters.cancel(id);
                return Ok(None);
            }
            match self.poll() {
                Ok(true) => {}
                Ok(false) => idle += 1,
                Err(e) => {
                    self.waiters.cancel(id);
                    return Err(e);
                }
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), TransportError> {
        match self.state {
            ConnectionState::Synchronized if self.device.is_some() => Ok(()),
            ConnectionState::Error => Err(TransportError::LinkClosed),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Tear the link down on fatal errors
    pub(super) fn settle<T>(
        &mut self,
        result: Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("link torn down: {}", e);
                self.state = ConnectionState::Error;
                self.awaiting_reply = false;
                self.reply = None;
                self.waiters.fail_all(|| TransportError::LinkClosed);
            }
        }
        result
    }

    /// Transmit one frame and run the ACK wait loop
    fn send_frame(&mut self, opcode: u8, payload: &[u8]) -> Result<Delivery, TransportError> {
        self.wait_for_flow()?;

        let flag = self.link.out_flag;
        let bytes = codec::encode(flag, opcode, payload)?;
        debug!(opcode, flag, len = payload.len(), "sending frame");
        self.write_frame(&bytes)?;

        let mut attempts = 1u32;
        loop {
            match self.receive_unit(self.config.ack_timeout())? {
                Inbound::Control(ControlCode::Ack) => {
                    self.link.out_flag = !self.link.out_flag;
                    debug!(opcode, "frame acknowledged");
                    return Ok(Delivery::Accepted);
                }
                Inbound::Control(ControlCode::Wait) => {
                    self.link.out_flag = !self.link.out_flag;
                    self.link.flow_blocked = true;
                    debug!(opcode, "frame queued, device busy");
                    return Ok(Delivery::Queued);
                }
                Inbound::Control(ControlCode::Stall) => {
                    return Err(TransportError::DeviceStall);
                }
                Inbound::Control(ControlCode::Startup) => {
                    return Err(self.device_rebooted());
                }
                Inbound::Control(ControlCode::Nack) | Inbound::Idle => {
                    if attempts > self.config.max_retries {
                        return Err(TransportError::LinkDead { attempts });
                    }
                    warn!(opcode, attempt = attempts, "no ACK, retransmitting");
                    self.stats.retransmissions += 1;
                    self.write_frame(&bytes)?;
                    attempts += 1;
                }
                Inbound::Control(other) => self.ignore_control(other),
                Inbound::Handled => {}
            }
        }
    }

    /// Block sends while the device queue is full
    fn wait_for_flow(&mut self) -> Result<(), TransportError> {
        let mut idle = 0u32;
        while self.link.flow_blocked {
            match self.receive_unit(self.config.ack_timeout())? {
                Inbound::Idle => {
                    idle += 1;
                    if idle >= self.config.flow_resume_polls {
                        return Err(TransportError::LinkDead { attempts: idle });
                    }
                }
                Inbound::Control(ControlCode::Startup) => return Err(self.device_rebooted()),
                Inbound::Control(other) => self.ignore_control(other),
                Inbound::Handled => {}
            }
        }
        Ok(())
    }

    /// Wait for the reply of the outstanding call
    fn await_reply(&mut self) -> Result<Frame, TransportError> {
        let mut idle = 0u32;
        loop {
            if let Some(frame) = self.reply.take() {
                self.awaiting_reply = false;
                return Ok(frame);
            }
            match self.receive_unit(self.config.ack_timeout())? {
                Inbound::Idle => {
                    idle += 1;
                    if idle > self.config.max_retries {
                        return Err(TransportError::LinkDead { attempts: idle });
                    }
                }
                Inbound::Control(ControlCode::Startup) => return Err(self.device_rebooted()),
                Inbound::Control(other) => self.ignore_control(other),
                Inbound::Handled => {}
            }
        }
    }

    fn poll_once(&mut self) -> Result<bool, TransportError> {
        match self.receive_unit(self.config.ack_timeout())? {
            Inbound::Idle => Ok(false),
            Inbound::Control(ControlCode::Startup) => Err(self.device_rebooted()),
            Inbound::Control(other) => {
                self.ignore_control(other);
                Ok(true)
            }
            Inbound::Handled => Ok(true),
        }
    }

    /// Unexpected STARTUP: the device rebooted under us
    pub(super) fn device_rebooted(&mut self) -> TransportError {
        warn!("device reset detected, link state cleared");
        self.reset_session(|| TransportError::DeviceReset);
        self.state = ConnectionState::Synchronized;
        self.handshake_state = HandshakeState::Synchronized;
        TransportError::DeviceReset
    }

    /// Drop every piece of per-session state, failing waiters with `error`
    pub(super) fn reset_session<E>(&mut self, error: E)
    where
        E: Fn() -> TransportError,
    {
        self.link.reset();
        self.reply = None;
        self.awaiting_reply = false;
        self.garbage_run = 0;
        self.waiters.fail_all(error);
    }

    pub(super) fn ignore_control(&mut self, code: ControlCode) {
        warn!("ignoring unexpected {:?}", code);
    }

    /// Read one unit: a control byte, a debug line, or a whole frame
    pub(super) fn receive_unit(&mut self, timeout: Duration) -> Result<Inbound, TransportError> {
        let Some(byte) = self.read_byte(timeout)? else {
            return Ok(Inbound::Idle);
        };

        if byte & 0x80 == 0 {
            self.receive_frame(byte)?;
            return Ok(Inbound::Handled);
        }

        match self.config.codes.classify(byte) {
            Some(ControlCode::Debug) => {
                self.garbage_run = 0;
                self.receive_debug_line()?;
                Ok(Inbound::Handled)
            }
            Some(code) => {
                self.garbage_run = 0;
                trace!("control {:?}", code);
                Ok(Inbound::Control(code))
            }
            None => {
                self.note_garbage(byte)?;
                Ok(Inbound::Handled)
            }
        }
    }

    fn note_garbage(&mut self, byte: u8) -> Result<(), TransportError> {
        self.garbage_run += 1;
        self.stats.garbage_bytes += 1;
        warn!("dropping unrecognized byte {:#04x}", byte);
        if self.garbage_run > self.config.garbage_limit {
            return Err(TransportError::Garbage {
                count: self.garbage_run,
            });
        }
        Ok(())
    }

    /// Accumulate the rest of a frame whose length byte is `length`
    fn receive_frame(&mut self, length: u8) -> Result<(), TransportError> {
        if length == 0 {
            return self.note_garbage(length);
        }

        let total = codec::encoded_len(length);
        let mut buf = Vec::with_capacity(total);
        buf.push(length);
        while buf.len() < total {
            let chunk = self.read_bytes(total - buf.len(), self.config.byte_timeout())?;
            if chunk.is_empty() {
                warn!(
                    "timeout mid-frame after {} of {} bytes, sending NACK",
                    buf.len(),
                    total
                );
                return self.send_nack();
            }
            buf.extend_from_slice(&chunk);
        }

        let Some(frame) = codec::decode(&buf) else {
            warn!("checksum mismatch on {:02x?}, sending NACK", buf);
            return self.send_nack();
        };

        self.garbage_run = 0;
        self.stats.rx_frames += 1;
        self.send_control(ControlCode::Ack)?;

        if !self.link.is_new_inbound(frame.flag) {
            self.stats.duplicates += 1;
            debug!(opcode = frame.opcode, "duplicate frame acknowledged again");
            return Ok(());
        }
        self.link.in_flag = !self.link.in_flag;
        debug!(opcode = frame.opcode, len = frame.payload.len(), "frame accepted");
        self.dispatch(frame)
    }

    /// Hand an accepted frame to the classifier
    fn dispatch(&mut self, frame: Frame) -> Result<(), TransportError> {
        match classify(&self.config.opcodes, frame)? {
            Classified::Notification(notification) => self.deliver(notification),
            Classified::Reply(frame) => {
                // Answer to a probe that already timed out
                if frame.opcode == self.config.opcodes.pong
                    && self.state != ConnectionState::Probing
                {
                    debug!(payload = ?frame.payload, "dropping late pong");
                    return Ok(());
                }
                if !self.awaiting_reply || self.reply.is_some() {
                    return Err(TransportError::UnsolicitedReply {
                        opcode: frame.opcode,
                    });
                }
                self.reply = Some(frame);
                Ok(())
            }
        }
    }

    fn deliver(&mut self, notification: Notification) -> Result<(), TransportError> {
        match &notification {
            Notification::Message { code, text } => info!(code, "device: {}", text),
            Notification::DebugLine { text } => debug!(target: "steplink::device", "{}", text),
            other => debug!("notification {:?}", other),
        }

        // Leftovers from a previous session carry no meaning for this one
        if self.state == ConnectionState::Probing {
            if !matches!(notification, Notification::DebugLine { .. }) {
                debug!("dropping notification received while probing");
            }
            return Ok(());
        }

        self.link.apply(&notification)?;
        self.waiters.dispatch(&notification);
        Ok(())
    }

    /// Consume a NUL-terminated debug line of at most `max_debug_line` bytes
    fn receive_debug_line(&mut self) -> Result<(), TransportError> {
        let mut line = Vec::new();
        loop {
            if line.len() >= self.config.max_debug_line {
                warn!("debug line longer than {} bytes, truncated", line.len());
                break;
            }
            let Some(byte) = self.read_byte(self.config.byte_timeout())? else {
                warn!("debug line cut short after {} bytes", line.len());
                break;
            };
            if byte == 0 {
                break;
            }
            line.push(byte);
        }
        self.stats.debug_lines += 1;
        let text = String::from_utf8_lossy(&line).into_owned();
        self.deliver(Notification::DebugLine { text })
    }

    fn send_nack(&mut self) -> Result<(), TransportError> {
        self.stats.nacks_sent += 1;
        self.send_control(ControlCode::Nack)
    }

    pub(super) fn send_control(&mut self, code: ControlCode) -> Result<(), TransportError> {
        let byte = self.config.codes.byte(code);
        trace!("sending {:?}", code);
        self.write_raw(&[byte])
    }

    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stats.tx_frames += 1;
        self.write_raw(bytes)
    }

    pub(super) fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let device = self.device.as_mut().ok_or(TransportError::NotConnected)?;
        trace!("tx {:02x?}", bytes);
        device.write(bytes)?;
        self.stats.tx_bytes += bytes.len() as u64;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        Ok(self.read_bytes(1, timeout)?.first().copied())
    }

    fn read_bytes(&mut self, max: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let device = self.device.as_mut().ok_or(TransportError::NotConnected)?;
        let bytes = device.read(max, timeout)?;
        if !bytes.is_empty() {
            trace!("rx {:02x?}", bytes);
            self.stats.rx_bytes += bytes.len() as u64;
        }
        Ok(bytes)
    }
}

fn check_payload(payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(TransportError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    Ok(())
}
