//! Session registry.
//!
//! A session is one live client connection: its bound entity (0 until a
//! spawn is acknowledged), the last client sequence observed by the
//! gateway, and a liveness deadline reset by heartbeats. Teardown happens
//! only at tick boundaries: readers mark sessions defunct, the tick reaps.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::world::entity::{EntityId, SessionId};

/// Live connection state.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Bound entity, 0 until spawn acknowledged
    pub entity_id: EntityId,
    /// Last client sequence seen by the gateway
    pub last_sequence: u64,
    /// Liveness deadline; missing it tears the session down
    pub deadline: Instant,
    /// Transport closed; reap at the next tick boundary
    pub defunct: bool,
}

/// Registry of live sessions.
pub struct SessionRegistry {
    inner: RwLock<HashMap<SessionId, SessionRecord>>,
    timeout: Duration,
}

impl SessionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a new session with a fresh deadline.
    pub fn register(&self) -> SessionId {
        let id = Uuid::new_v4();
        let record = SessionRecord {
            id,
            entity_id: 0,
            last_sequence: 0,
            deadline: Instant::now() + self.timeout,
            defunct: false,
        };
        self.inner.write().insert(id, record);
        id
    }

    pub fn get(&self, id: SessionId) -> Option<SessionRecord> {
        self.inner.read().get(&id).cloned()
    }

    /// Bind the session to its spawned entity. At most one entity per
    /// session; rebinding a live binding is refused.
    pub fn bind_entity(&self, id: SessionId, entity_id: EntityId) -> bool {
        let mut inner = self.inner.write();
        match inner.get_mut(&id) {
            Some(record) if record.entity_id == 0 => {
                record.entity_id = entity_id;
                true
            }
            _ => false,
        }
    }

    pub fn entity_of(&self, id: SessionId) -> Option<EntityId> {
        self.inner
            .read()
            .get(&id)
            .map(|r| r.entity_id)
            .filter(|&e| e != 0)
    }

    /// Track the highest client sequence seen on this connection.
    pub fn record_sequence(&self, id: SessionId, sequence: u64) {
        if let Some(record) = self.inner.write().get_mut(&id) {
            if sequence > record.last_sequence {
                record.last_sequence = sequence;
            }
        }
    }

    /// Heartbeat: push the liveness deadline out.
    pub fn touch(&self, id: SessionId) -> bool {
        match self.inner.write().get_mut(&id) {
            Some(record) => {
                record.deadline = Instant::now() + self.timeout;
                true
            }
            None => false,
        }
    }

    /// Transport closed; the tick will reap this session.
    pub fn mark_defunct(&self, id: SessionId) {
        if let Some(record) = self.inner.write().get_mut(&id) {
            record.defunct = true;
        }
    }

    /// Remove every expired or defunct session, returning (session, bound
    /// entity) pairs for teardown. Called once per tick.
    pub fn reap(&self, now: Instant) -> Vec<(SessionId, EntityId)> {
        let mut inner = self.inner.write();
        let dead: Vec<SessionId> = inner
            .values()
            .filter(|r| r.defunct || r.deadline <= now)
            .map(|r| r.id)
            .collect();

        dead.iter()
            .filter_map(|id| inner.remove(id))
            .map(|r| (r.id, r.entity_id))
            .collect()
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionRecord> {
        self.inner.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
