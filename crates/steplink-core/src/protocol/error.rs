//! Transport errors

use thiserror::Error;

/// Errors surfaced by the transport to its callers.
///
/// Line noise (checksum mismatches, truncated reads, NACKs) never shows up
/// here; it is absorbed by retransmission inside the connection.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Link closed")]
    LinkClosed,

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Invalid opcode {0:#04x}: opcodes must be below 0x80")]
    InvalidOpcode(u8),

    #[error("Link dead: no acknowledgement after {attempts} attempts")]
    LinkDead { attempts: u32 },

    #[error("Device stalled: command rejected")]
    DeviceStall,

    #[error("Device reset during session")]
    DeviceReset,

    #[error("Handshake failed after {attempts} probes")]
    HandshakeFailed { attempts: u32 },

    #[error("Move acknowledgement underflow: {completed} completed with {outstanding} outstanding")]
    MoveAckUnderflow { outstanding: u32, completed: u32 },

    #[error("Unexpected reply: expected opcode {expected:#04x}, got {actual:#04x}")]
    UnexpectedReply { expected: u8, actual: u8 },

    #[error("Unsolicited reply with opcode {opcode:#04x}")]
    UnsolicitedReply { opcode: u8 },

    #[error("Malformed notification {opcode:#04x} with {len} payload bytes")]
    MalformedNotification { opcode: u8, len: usize },

    #[error("Lost framing: {count} unrecognized bytes")]
    Garbage { count: usize },
}

impl TransportError {
    /// Protocol desynchronization: host and device no longer agree on link state.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            TransportError::MoveAckUnderflow { .. }
                | TransportError::UnexpectedReply { .. }
                | TransportError::UnsolicitedReply { .. }
                | TransportError::MalformedNotification { .. }
                | TransportError::Garbage { .. }
        )
    }

    /// Whether the link is torn down after this error.
    pub fn is_fatal(&self) -> bool {
        self.is_desync()
            || matches!(
                self,
                TransportError::Serial(_)
                    | TransportError::Io(_)
                    | TransportError::LinkDead { .. }
                    | TransportError::DeviceStall
                    | TransportError::HandshakeFailed { .. }
            )
    }
}
