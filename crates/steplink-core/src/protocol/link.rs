//! Per-connection link state

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::events::Notification;
use super::TransportError;

/// State shared by both directions of one open connection.
///
/// Owned exclusively by the [`Connection`](super::Connection); reset whenever
/// the device reboots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    /// Flag carried by the next new outbound frame
    pub out_flag: bool,
    /// Flag expected on the next new inbound frame
    pub in_flag: bool,
    /// Device queue is full; sends wait for FlowContinue
    pub flow_blocked: bool,
    /// Queued commands not yet reported complete
    pub outstanding_move_acks: u32,
    /// Channels with an armed temperature alarm
    pub pending_alarm_channels: BTreeSet<u8>,
    /// Channels whose alarm has fired
    pub triggered_alarms: BTreeSet<u8>,
    /// Last reported limit position per (space, motor)
    pub recorded_limits: BTreeMap<(u8, u8), i32>,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; used on device reboot
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether an inbound frame with `flag` is new (not a retransmission)
    pub fn is_new_inbound(&self, flag: bool) -> bool {
        flag == self.in_flag
    }

    /// Apply a notification to the link state
    pub fn apply(&mut self, notification: &Notification) -> Result<(), TransportError> {
        match notification {
            Notification::MoveComplete { count } => {
                let completed = u32::from(*count);
                self.outstanding_move_acks = self
                    .outstanding_move_acks
                    .checked_sub(completed)
                    .ok_or(TransportError::MoveAckUnderflow {
                        outstanding: self.outstanding_move_acks,
                        completed,
                    })?;
            }
            Notification::TempAlarm { channel } => {
                self.pending_alarm_channels.remove(channel);
                self.triggered_alarms.insert(*channel);
            }
            Notification::FlowContinue => {
                self.flow_blocked = false;
            }
            Notification::LimitHit {
                space,
                motor,
                position,
            } => {
                self.recorded_limits.insert((*space, *motor), *position);
            }
            Notification::Message { .. } | Notification::DebugLine { .. } => {}
        }
        Ok(())
    }
}

/// Cumulative traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub retransmissions: u64,
    pub nacks_sent: u64,
    pub duplicates: u64,
    pub garbage_bytes: u64,
    pub debug_lines: u64,
}
