//! Broadcast dispatcher: per-session bounded outbound queues.
//!
//! The single deliberate backpressure choice lives here: when a session's
//! queue is full the new message is dropped and counted. The tick never
//! blocks on a slow client, and a session is never closed just because
//! AOI updates were dropped.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::world::entity::SessionId;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Message queued for the writer task.
    Sent,
    /// Queue full; the new message was discarded (drop-newest).
    Dropped,
    /// No queue for this session (never registered, or already closed).
    Closed,
}

struct Outbound {
    tx: mpsc::Sender<Vec<u8>>,
    drops: u64,
}

/// Owns one bounded outbound queue per session.
pub struct BroadcastDispatcher {
    queues: RwLock<HashMap<SessionId, Outbound>>,
    depth: usize,
    total_drops: AtomicU64,
}

impl BroadcastDispatcher {
    pub fn new(depth: usize) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            depth,
            total_drops: AtomicU64::new(0),
        }
    }

    /// Create the session's queue. The returned receiver is the single
    /// consumer, owned by the session's writer task.
    pub fn register(&self, session: SessionId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.depth);
        self.queues
            .write()
            .insert(session, Outbound { tx, drops: 0 });
        rx
    }

    /// Enqueue encoded bytes for one session, dropping the new message if
    /// the queue is full.
    pub fn send_to(&self, session: SessionId, payload: Vec<u8>) -> SendOutcome {
        let mut queues = self.queues.write();
        let Some(outbound) = queues.get_mut(&session) else {
            return SendOutcome::Closed;
        };

        match outbound.tx.try_send(payload) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                outbound.drops += 1;
                self.total_drops.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// Drop count for one session.
    pub fn drops(&self, session: SessionId) -> u64 {
        self.queues
            .read()
            .get(&session)
            .map(|o| o.drops)
            .unwrap_or(0)
    }

    /// Total messages dropped across all sessions since startup.
    pub fn total_drops(&self) -> u64 {
        self.total_drops.load(Ordering::Relaxed)
    }

    /// Close and remove the session's queue; the writer task sees the
    /// channel end and exits.
    pub fn close(&self, session: SessionId) -> bool {
        self.queues.write().remove(&session).is_some()
    }

    /// Close every queue (shutdown after the final tick).
    pub fn close_all(&self) {
        self.queues.write().clear();
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }
}
