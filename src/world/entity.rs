use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::util::vec2::Vec2;

/// Stable entity identifier. 0 is reserved to mean "unbound".
pub type EntityId = u32;

/// Identifier of a live client connection.
pub type SessionId = Uuid;

/// Canonical record of a moving object. Mutated exclusively by the tick
/// pipeline; inbound handlers only stage intents against it.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    /// Owning session, None for NPC-like entities
    pub session: Option<SessionId>,
    /// Free-form type tag ("player", "probe", ...)
    pub kind: String,
    pub position: Vec2,
    /// World units per tick
    pub velocity: Vec2,
    /// Heading of the most recent accepted movement, radians
    pub rotation: f64,
    /// Highest client sequence applied to this entity; never decreases
    pub last_sequence: u64,
    /// Unix millis of the last authoritative mutation
    pub last_update_ms: u64,
}

impl Entity {
    pub fn new(id: EntityId, kind: &str, position: Vec2, session: Option<SessionId>) -> Self {
        Self {
            id,
            session,
            kind: kind.to_string(),
            position,
            velocity: Vec2::ZERO,
            rotation: 0.0,
            last_sequence: 0,
            last_update_ms: now_ms(),
        }
    }

    /// Whether broadcasts are computed from this entity's position.
    pub fn is_observer(&self) -> bool {
        self.session.is_some()
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
