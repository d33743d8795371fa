//! Control codes and opcode tables
//!
//! Firmware variants differ only in the numeric values assigned to control
//! bytes and opcodes, so both are carried as configuration rather than
//! hard-coded constants.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::TransportError;

/// Single-byte out-of-band signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlCode {
    /// Frame accepted
    Ack,
    /// Frame rejected, retransmit
    Nack,
    /// Frame accepted, device queue full
    Wait,
    /// Frame rejected, no recovery
    Stall,
    /// Host requests a device reset
    Reset,
    /// Device has (re)booted
    Startup,
    /// Device acknowledges a reset request
    AckReset,
    /// NUL-terminated debug text follows
    Debug,
    /// Identification probe (followed by a nonce byte)
    Id,
}

/// Numeric values of the control codes.
///
/// Every value must have the high bit set so it can never be mistaken for a
/// frame length byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlCodes {
    pub ack: u8,
    pub nack: u8,
    pub wait: u8,
    pub stall: u8,
    pub reset: u8,
    pub startup: u8,
    pub ack_reset: u8,
    pub debug: u8,
    pub id: u8,
}

impl Default for ControlCodes {
    fn default() -> Self {
        Self {
            ack: 0x80,
            nack: 0x81,
            wait: 0x82,
            stall: 0x83,
            reset: 0x84,
            startup: 0x85,
            ack_reset: 0x86,
            debug: 0x87,
            id: 0x88,
        }
    }
}

impl ControlCodes {
    fn entries(&self) -> [(ControlCode, u8); 9] {
        [
            (ControlCode::Ack, self.ack),
            (ControlCode::Nack, self.nack),
            (ControlCode::Wait, self.wait),
            (ControlCode::Stall, self.stall),
            (ControlCode::Reset, self.reset),
            (ControlCode::Startup, self.startup),
            (ControlCode::AckReset, self.ack_reset),
            (ControlCode::Debug, self.debug),
            (ControlCode::Id, self.id),
        ]
    }

    /// Look up the control code for a received byte
    pub fn classify(&self, byte: u8) -> Option<ControlCode> {
        self.entries()
            .into_iter()
            .find(|&(_, value)| value == byte)
            .map(|(code, _)| code)
    }

    /// Wire byte for a control code
    pub fn byte(&self, code: ControlCode) -> u8 {
        match code {
            ControlCode::Ack => self.ack,
            ControlCode::Nack => self.nack,
            ControlCode::Wait => self.wait,
            ControlCode::Stall => self.stall,
            ControlCode::Reset => self.reset,
            ControlCode::Startup => self.startup,
            ControlCode::AckReset => self.ack_reset,
            ControlCode::Debug => self.debug,
            ControlCode::Id => self.id,
        }
    }

    /// Check that values are pairwise distinct and have the high bit set
    pub fn validate(&self) -> Result<(), TransportError> {
        let mut seen = BTreeSet::new();
        for (code, value) in self.entries() {
            if value & 0x80 == 0 {
                return Err(TransportError::Config(format!(
                    "control code {:?} = {:#04x} lacks the high bit",
                    code, value
                )));
            }
            if !seen.insert(value) {
                return Err(TransportError::Config(format!(
                    "control code {:?} = {:#04x} is not unique",
                    code, value
                )));
            }
        }
        Ok(())
    }
}

/// Opcodes the device uses for notifications, plus request/reply pairings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpcodeTable {
    /// `[count:u8]` queued commands finished
    pub move_complete: u8,
    /// `[channel:u8]` temperature alarm fired
    pub temp_alarm: u8,
    /// `[]` device queue has room again
    pub flow_continue: u8,
    /// `[space:u8, motor:u8, position:i32 LE]` limit switch hit
    pub limit_hit: u8,
    /// `[code:u8, text...]` device message
    pub message: u8,
    /// `[nonce:u8]` answer to an ID probe
    pub pong: u8,
    /// Request opcode to expected reply opcode
    pub replies: BTreeMap<u8, u8>,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self {
            move_complete: 0x60,
            temp_alarm: 0x61,
            flow_continue: 0x62,
            limit_hit: 0x63,
            message: 0x64,
            pong: 0x65,
            replies: BTreeMap::new(),
        }
    }
}

impl OpcodeTable {
    /// Register the reply opcode expected for a request opcode
    pub fn with_reply(mut self, request: u8, reply: u8) -> Self {
        self.replies.insert(request, reply);
        self
    }

    /// Expected reply opcode for a request, if it has one
    pub fn reply_for(&self, request: u8) -> Option<u8> {
        self.replies.get(&request).copied()
    }

    fn notifications(&self) -> [u8; 5] {
        [
            self.move_complete,
            self.temp_alarm,
            self.flow_continue,
            self.limit_hit,
            self.message,
        ]
    }

    /// Whether an opcode is consumed by the transport rather than returned to a caller
    pub fn is_notification(&self, opcode: u8) -> bool {
        self.notifications().contains(&opcode)
    }

    /// Check that opcodes fit in 7 bits and notifications do not collide
    pub fn validate(&self) -> Result<(), TransportError> {
        let mut seen = BTreeSet::new();
        for opcode in self.notifications().into_iter().chain([self.pong]) {
            if opcode & 0x80 != 0 {
                return Err(TransportError::InvalidOpcode(opcode));
            }
            if !seen.insert(opcode) {
                return Err(TransportError::Config(format!(
                    "notification opcode {:#04x} is assigned twice",
                    opcode
                )));
            }
        }
        for (&request, &reply) in &self.replies {
            if request & 0x80 != 0 {
                return Err(TransportError::InvalidOpcode(request));
            }
            if reply & 0x80 != 0 {
                return Err(TransportError::InvalidOpcode(reply));
            }
            if self.is_notification(reply) {
                return Err(TransportError::Config(format!(
                    "reply opcode {:#04x} is also a notification",
                    reply
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codes_valid() {
        assert!(ControlCodes::default().validate().is_ok());
        assert!(OpcodeTable::default().validate().is_ok());
    }

    #[test]
    fn test_classify_roundtrip() {
        let codes = ControlCodes::default();
        for value in 0x80..=0x88u8 {
            let code = codes.classify(value).unwrap();
            assert_eq!(codes.byte(code), value);
        }
        assert_eq!(codes.classify(0x89), None);
        assert_eq!(codes.classify(0x05), None);
    }

    #[test]
    fn test_duplicate_control_code_rejected() {
        let codes = ControlCodes {
            wait: 0x80,
            ..ControlCodes::default()
        };
        assert!(codes.validate().is_err());
    }

    #[test]
    fn test_control_code_without_high_bit_rejected() {
        let codes = ControlCodes {
            debug: 0x07,
            ..ControlCodes::default()
        };
        assert!(codes.validate().is_err());
    }

    #[test]
    fn test_reply_table() {
        let table = OpcodeTable::default().with_reply(0x10, 0x50);
        assert_eq!(table.reply_for(0x10), Some(0x50));
        assert_eq!(table.reply_for(0x11), None);
        assert!(table.is_notification(0x60));
        assert!(!table.is_notification(0x50));
        assert!(!table.is_notification(table.pong));
    }

    #[test]
    fn test_reply_colliding_with_notification_rejected() {
        let table = OpcodeTable::default().with_reply(0x10, 0x61);
        assert!(table.validate().is_err());
    }
}
