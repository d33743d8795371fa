//! Notification classification and waiters
//!
//! Every accepted inbound frame is either a notification, consumed by the
//! transport itself, or a reply, handed to the caller that is waiting on the
//! link. Higher layers that need to wait for a later notification (a queued
//! move finishing, a temperature alarm) register a one-shot waiter instead of
//! blocking the link.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{Frame, OpcodeTable, TransportError};

/// Asynchronous events pushed by the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// `count` queued commands finished executing
    MoveComplete { count: u8 },
    /// Temperature alarm on `channel` fired
    TempAlarm { channel: u8 },
    /// Device queue accepts commands again
    FlowContinue,
    /// A limit switch was hit
    LimitHit { space: u8, motor: u8, position: i32 },
    /// Device status message
    Message { code: u8, text: String },
    /// Out-of-band debug text
    DebugLine { text: String },
}

impl Notification {
    pub fn is_move_complete(&self) -> bool {
        matches!(self, Notification::MoveComplete { .. })
    }

    /// Matches a temperature alarm on `channel`, or on any channel when `None`
    pub fn matches_alarm(&self, channel: Option<u8>) -> bool {
        match (self, channel) {
            (Notification::TempAlarm { .. }, None) => true,
            (Notification::TempAlarm { channel: fired }, Some(wanted)) => *fired == wanted,
            _ => false,
        }
    }
}

/// Result of classifying an accepted frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Notification(Notification),
    Reply(Frame),
}

/// Sort an accepted frame into a notification or a reply.
///
/// A notification opcode with a payload of the wrong shape means the two
/// ends disagree on the protocol and is reported as a desync.
pub fn classify(table: &OpcodeTable, frame: Frame) -> Result<Classified, TransportError> {
    let opcode = frame.opcode;
    let malformed = TransportError::MalformedNotification {
        opcode,
        len: frame.payload.len(),
    };
    let payload = frame.payload.as_slice();

    let notification = if opcode == table.move_complete {
        match payload {
            [count] => Notification::MoveComplete { count: *count },
            _ => return Err(malformed),
        }
    } else if opcode == table.temp_alarm {
        match payload {
            [channel] => Notification::TempAlarm { channel: *channel },
            _ => return Err(malformed),
        }
    } else if opcode == table.flow_continue {
        if !payload.is_empty() {
            return Err(malformed);
        }
        Notification::FlowContinue
    } else if opcode == table.limit_hit {
        if payload.len() != 6 {
            return Err(malformed);
        }
        Notification::LimitHit {
            space: payload[0],
            motor: payload[1],
            position: LittleEndian::read_i32(&payload[2..6]),
        }
    } else if opcode == table.message {
        match payload {
            [code, text @ ..] => Notification::Message {
                code: *code,
                text: String::from_utf8_lossy(text).into_owned(),
            },
            _ => return Err(malformed),
        }
    } else {
        return Ok(Classified::Reply(frame));
    };

    Ok(Classified::Notification(notification))
}

type Predicate = Box<dyn Fn(&Notification) -> bool + Send>;
type Callback = Box<dyn FnOnce(Result<Notification, TransportError>) + Send>;

/// Future side of a registered waiter
pub type PendingNotification = oneshot::Receiver<Result<Notification, TransportError>>;

/// Handle for cancelling a registered waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

struct Waiter {
    id: WaiterId,
    predicate: Predicate,
    callback: Callback,
}

/// One-shot notification waiters, fired in registration order
#[derive(Default)]
pub struct WaiterRegistry {
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback fired once, on the first notification matching `predicate`
    pub fn register<P, F>(&mut self, predicate: P, callback: F) -> WaiterId
    where
        P: Fn(&Notification) -> bool + Send + 'static,
        F: FnOnce(Result<Notification, TransportError>) + Send + 'static,
    {
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        self.waiters.push(Waiter {
            id,
            predicate: Box::new(predicate),
            callback: Box::new(callback),
        });
        id
    }

    /// Register a waiter and return the receiving end as a future
    pub fn wait_for<P>(&mut self, predicate: P) -> PendingNotification
    where
        P: Fn(&Notification) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.register(predicate, move |result| {
            // Receiver may have been dropped by an uninterested caller
            let _ = tx.send(result);
        });
        rx
    }

    /// Remove a waiter without firing it
    pub fn cancel(&mut self, id: WaiterId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.id != id);
        self.waiters.len() != before
    }

    /// Fire and remove every waiter matching `notification`; returns how many fired
    pub fn dispatch(&mut self, notification: &Notification) -> usize {
        let (fired, kept): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| (w.predicate)(notification));
        self.waiters = kept;
        let count = fired.len();
        for waiter in fired {
            (waiter.callback)(Ok(notification.clone()));
        }
        count
    }

    /// Complete every waiter with an error produced by `error`
    pub fn fail_all<E>(&mut self, error: E)
    where
        E: Fn() -> TransportError,
    {
        for waiter in std::mem::take(&mut self.waiters) {
            (waiter.callback)(Err(error()));
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl std::fmt::Debug for WaiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaiterRegistry")
            .field("waiters", &self.waiters.len())
            .finish()
    }
}
