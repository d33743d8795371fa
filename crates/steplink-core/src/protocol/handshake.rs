//! Boot / resync handshake
//!
//! Brings both sequence flags into a known state after open, after a DTR
//! reset, or after a soft reset. The host repeatedly sends an ID probe (the
//! ID control byte followed by a random nonce) until either:
//!
//! - the device announces a cold boot with STARTUP: both flags restart at
//!   `false`, or
//! - three consecutive Pong replies echo the probe nonce: the device kept
//!   running, and the locally tracked flags already agree with it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    connection::{ConnectionState, Inbound},
    Connection, ControlCode, SerialDevice, TransportError,
};

/// Consecutive matching pongs needed for a warm reconnect
const PONGS_REQUIRED: u8 = 3;

/// How long DTR is held low to reset the firmware
const DTR_PULSE: Duration = Duration::from_millis(50);

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Probing; `pongs` matching replies seen in a row
    Probing { pongs: u8 },
    /// Device announced a cold boot
    StartupSeen,
    /// Device answered enough probes without rebooting
    PongTripleSeen,
    /// Flags agreed
    Synchronized,
}

impl Default for HandshakeState {
    fn default() -> Self {
        HandshakeState::Probing { pongs: 0 }
    }
}

impl HandshakeState {
    pub fn on_startup(self) -> Self {
        match self {
            HandshakeState::Probing { .. } => HandshakeState::StartupSeen,
            other => other,
        }
    }

    /// A pong arrived; `matches` tells whether it echoed the current nonce
    pub fn on_pong(self, matches: bool) -> Self {
        match self {
            HandshakeState::Probing { pongs } if matches => {
                if pongs + 1 >= PONGS_REQUIRED {
                    HandshakeState::PongTripleSeen
                } else {
                    HandshakeState::Probing { pongs: pongs + 1 }
                }
            }
            HandshakeState::Probing { .. } => HandshakeState::Probing { pongs: 0 },
            other => other,
        }
    }

    pub fn finish(self) -> Self {
        match self {
            HandshakeState::StartupSeen | HandshakeState::PongTripleSeen => {
                HandshakeState::Synchronized
            }
            other => other,
        }
    }
}

/// How the handshake completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Boot {
    /// Device rebooted; flags restarted
    Cold,
    /// Device kept running; flags kept
    Warm,
}

impl<D: SerialDevice> Connection<D> {
    /// Current handshake progress
    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake_state
    }

    /// Probe the device until both flags are known to agree
    pub fn handshake(&mut self) -> Result<Boot, TransportError> {
        if self.device.is_none() {
            return Err(TransportError::NotConnected);
        }
        self.state = ConnectionState::Probing;
        self.handshake_state = HandshakeState::default();

        let result = self.probe();
        self.reply = None;
        self.awaiting_reply = false;
        match result {
            Ok(boot) => {
                self.handshake_state = self.handshake_state.finish();
                self.state = ConnectionState::Synchronized;
                info!(?boot, "link synchronized");
                Ok(boot)
            }
            Err(e) => {
                self.state = ConnectionState::Error;
                self.waiters.fail_all(|| TransportError::LinkClosed);
                Err(e)
            }
        }
    }

    fn probe(&mut self) -> Result<Boot, TransportError> {
        let mut rng = rand::thread_rng();
        let attempts = self.config.max_probe_attempts;

        for attempt in 1..=attempts {
            let nonce: u8 = rng.gen_range(0..0x80);
            self.reply = None;
            self.awaiting_reply = true;
            let id = self.config.codes.byte(ControlCode::Id);
            self.write_raw(&[id, nonce])?;
            debug!(attempt, nonce, "sent ID probe");

            loop {
                match self.receive_unit(self.config.ack_timeout())? {
                    Inbound::Idle => break,
                    Inbound::Control(ControlCode::Startup) => {
                        self.handshake_state = self.handshake_state.on_startup();
                        self.reset_session(|| TransportError::DeviceReset);
                        info!("device cold boot");
                        return Ok(Boot::Cold);
                    }
                    Inbound::Control(other) => self.ignore_control(other),
                    Inbound::Handled => {
                        let Some(frame) = self.reply.take() else {
                            continue;
                        };
                        let matches =
                            frame.opcode == self.config.opcodes.pong && frame.payload == [nonce];
                        self.handshake_state = self.handshake_state.on_pong(matches);
                        if !matches {
                            // This probe's pong may still be queued behind it
                            warn!(opcode = frame.opcode, "stale reply while probing");
                            continue;
                        }
                        if self.handshake_state == HandshakeState::PongTripleSeen {
                            return Ok(Boot::Warm);
                        }
                        self.awaiting_reply = false;
                        break;
                    }
                }
            }
        }

        Err(TransportError::HandshakeFailed { attempts })
    }

    /// Pulse DTR to reboot the firmware, then handshake again
    pub fn hard_reset(&mut self) -> Result<Boot, TransportError> {
        let device = self.device.as_mut().ok_or(TransportError::NotConnected)?;
        info!("resetting device via DTR");
        device.set_dtr(false)?;
        std::thread::sleep(DTR_PULSE);
        device.set_dtr(true)?;
        device.clear_input()?;

        self.reset_session(|| TransportError::DeviceReset);
        self.handshake()
    }

    /// Ask the firmware to reset itself with the RESET control byte, then
    /// handshake again
    pub fn soft_reset(&mut self) -> Result<Boot, TransportError> {
        if self.device.is_none() {
            return Err(TransportError::NotConnected);
        }
        info!("requesting device reset");
        if let Err(e) = self.send_control(ControlCode::Reset) {
            return self.settle(Err(e));
        }

        let mut idle = 0u32;
        loop {
            match self.receive_unit(self.config.ack_timeout()) {
                Ok(Inbound::Control(ControlCode::AckReset))
                | Ok(Inbound::Control(ControlCode::Startup)) => break,
                Ok(Inbound::Idle) => {
                    idle += 1;
                    if idle > self.config.max_retries {
                        let err = TransportError::LinkDead { attempts: idle };
                        return self.settle(Err(err));
                    }
                }
                Ok(Inbound::Control(other)) => self.ignore_control(other),
                Ok(Inbound::Handled) => {}
                Err(e) => return self.settle(Err(e)),
            }
        }

        self.reset_session(|| TransportError::DeviceReset);
        self.handshake()
    }
}
