//! Movement-intent staging between connection readers and the tick.
//!
//! Readers submit without blocking over a bounded crossbeam channel; the
//! tick drains everything staged since the previous drain in one pass.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::util::vec2::Vec2;
use crate::world::entity::EntityId;

/// A client's requested movement: `delta` is a velocity in world units per
/// tick, not a position offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementIntent {
    pub entity_id: EntityId,
    pub sequence: u64,
    pub delta: Vec2,
    pub timestamp_ms: u64,
}

/// Staging buffer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IntentError {
    #[error("intent buffer full")]
    Full,
    #[error("intent buffer disconnected")]
    Disconnected,
}

/// Bounded MPSC staging area, drained once per tick.
pub struct IntentBuffer {
    sender: Sender<MovementIntent>,
    receiver: Receiver<MovementIntent>,
    capacity: usize,
}

impl IntentBuffer {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    /// Non-blocking submit, safe from any number of reader tasks; `Full`
    /// is backpressure, not an error worth tearing a session down over.
    pub fn try_submit(&self, intent: MovementIntent) -> Result<(), IntentError> {
        self.sender.try_send(intent).map_err(|e| match e {
            TrySendError::Full(_) => IntentError::Full,
            TrySendError::Disconnected(_) => IntentError::Disconnected,
        })
    }

    /// Move everything staged since the previous drain out of the buffer.
    pub fn drain(&self) -> Vec<MovementIntent> {
        self.receiver.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
