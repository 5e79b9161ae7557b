//! Wire protocol: tagged message enums and the bincode codec.

use serde::{Deserialize, Serialize};

use crate::world::entity::{Entity, EntityId};

/// Despawn reason sent when a neighbor leaves an observer's AOI.
pub const REASON_OUT_OF_AOI: &str = "out_of_aoi";
/// Despawn reason sent when an entity is destroyed.
pub const REASON_REMOVED: &str = "removed";

/// Messages from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Request to install an entity for this session
    Spawn(SpawnRequest),
    /// Buffered movement intent for the next tick
    Movement(MovementDelta),
    /// Liveness signal; resets the session deadline
    Heartbeat { client_id: EntityId },
}

/// Messages from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    SpawnResponse {
        success: bool,
        entity_id: EntityId,
        error: String,
        x: f64,
        y: f64,
    },
    /// Per-tick AOI envelope for one observer
    Snapshot(WorldSnapshot),
    /// Authoritative state after a clamped or rejected intent, or a forced
    /// integration clamp
    Correction(Correction),
    /// Entity left the observer's AOI or was destroyed
    Despawn { entity_id: EntityId, reason: String },
    /// Heartbeat echo
    Heartbeat { client_id: EntityId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub kind: String,
    pub x: f64,
    pub y: f64,
}

/// Movement message. Client to server it is an intent whose `dx`/`dy` is a
/// requested velocity in world units per tick; server to client it is the
/// position-only update for a persistent AOI neighbor, with `dx`/`dy`
/// carrying the post-move position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovementDelta {
    pub entity_id: EntityId,
    pub sequence: u64,
    pub dx: f32,
    pub dy: f32,
    pub timestamp_ms: u64,
}

/// Full state for a newly entered AOI neighbor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: EntityId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub rotation: f64,
    pub last_update_ms: u64,
}

impl EntityState {
    pub fn from_entity(entity: &Entity) -> Self {
        Self {
            entity_id: entity.id,
            x: entity.position.x,
            y: entity.position.y,
            vx: entity.velocity.x,
            vy: entity.velocity.y,
            rotation: entity.rotation,
            last_update_ms: entity.last_update_ms,
        }
    }
}

/// Per-tick envelope for one observer: full states for entered neighbors,
/// deltas for persistent neighbors that moved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub entities: Vec<EntityState>,
    pub deltas: Vec<MovementDelta>,
}

impl WorldSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.deltas.is_empty()
    }
}

/// Authoritative post-validation state for the owning session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub entity_id: EntityId,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub ack_sequence: u64,
}

impl Correction {
    pub fn from_entity(entity: &Entity, ack_sequence: u64) -> Self {
        Self {
            entity_id: entity.id,
            x: entity.position.x,
            y: entity.position.y,
            vx: entity.velocity.x,
            vy: entity.velocity.y,
            ack_sequence,
        }
    }
}

/// Encoding failure (message could not be serialized).
#[derive(Debug, thiserror::Error)]
#[error("encode error: {0}")]
pub struct EncodeError(#[from] bincode::error::EncodeError);

/// Inbound message failures. Local to the offending session: logged,
/// discarded, never fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("invalid message: {0}")]
    Empty(&'static str),
}

/// Encode a message using bincode.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy()).map_err(EncodeError::from)
}

/// Decode a message using bincode.
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, MessageError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(message, _)| message)
        .map_err(MessageError::from)
}

/// Structural validity beyond decoding: a decoded message that is
/// semantically empty is discarded before it reaches the engine.
pub fn check_semantics(message: &ClientMessage) -> Result<(), MessageError> {
    match message {
        ClientMessage::Spawn(req) if req.kind.is_empty() => {
            Err(MessageError::Empty("spawn without entity type"))
        }
        ClientMessage::Movement(delta) if delta.entity_id == 0 => {
            Err(MessageError::Empty("movement without entity id"))
        }
        _ => Ok(()),
    }
}
