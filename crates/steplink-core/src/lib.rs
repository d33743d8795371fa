//! # steplink Core Library
//!
//! Host-side transport for stepper and temperature controller firmware.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Checksum-protected binary framing over a raw serial byte stream
//! - Stop-and-wait retransmission with one sequence flag per direction
//! - Separation of device notifications (move completion, temperature
//!   alarms, limit switches, debug text) from command replies
//! - The boot handshake that resynchronizes after firmware reboots
//!
//! ## Example
//!
//! ```rust,ignore
//! use steplink_core::{config::ConnectionConfig, protocol::{Connection, Notification}};
//!
//! let mut conn = Connection::open(ConnectionConfig::for_port("/dev/ttyACM0"))?;
//!
//! // Queue a move and get told when it finishes
//! conn.call_queued(0x10, &[0x01, 0x02])?;
//! let done = conn.wait_for(Notification::is_move_complete);
//!
//! // Drive the link while idle
//! while conn.outstanding_moves() > 0 {
//!     conn.poll()?;
//! }
//! ```

pub mod config;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ConnectionConfig;
    pub use crate::protocol::{
        Boot, Connection, ConnectionState, ControlCodes, Delivery, Notification, OpcodeTable,
        SerialDevice, TransportError,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
