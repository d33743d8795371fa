//! Firmware Link Protocol
//!
//! Implements the reliable serial transport between the host and the motion
//! controller firmware: checksum-protected frames, a stop-and-wait ARQ with
//! one alternating sequence flag per direction, and separation of device
//! notifications from command replies.

pub mod codec;
pub mod codes;
mod connection;
mod error;
pub mod events;
mod handshake;
pub mod link;
pub mod serial;
pub mod stream;

pub use codec::{decode, encode, Frame};
pub use codes::{ControlCode, ControlCodes, OpcodeTable};
pub use connection::{Connection, ConnectionState, Delivery, Reply};
pub use error::TransportError;
pub use events::{Classified, Notification, PendingNotification, WaiterId};
pub use handshake::{Boot, HandshakeState};
pub use link::{LinkState, LinkStats};
pub use serial::{list_ports, PortInfo};
pub use stream::{SerialChannel, SerialDevice};

/// Default baud rate for the controller link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default time to wait for an acknowledgement, in milliseconds
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 200;

/// Default inter-byte timeout inside a frame, in milliseconds
pub const DEFAULT_BYTE_TIMEOUT_MS: u64 = 20;

/// Default retransmission ceiling
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// Largest payload the connection sends or accepts, keeping every length
/// byte below 0x80 and therefore distinct from control codes
pub const MAX_PAYLOAD: usize = 126;
