//! Server-side movement authority.
//!
//! Every client movement intent passes through `Validator::validate` before
//! it can become state. Checks run in a fixed order: sequence monotonicity,
//! teleport guard on the raw magnitude, speed clamp, bounds clamp. Clamped
//! and rejected intents each owe the client exactly one Correction.

use crate::config::WorldBounds;
use crate::sim::intent::MovementIntent;
use crate::util::vec2::Vec2;
use crate::world::entity::{now_ms, Entity};

/// Velocity decay applied once per tick after integration. Entities without
/// renewed intents coast to a stop over a few ticks.
pub const FRICTION: f64 = 0.95;

/// Raw intent magnitudes beyond this multiple of max speed are rejected
/// outright instead of clamped.
pub const TELEPORT_FACTOR: f64 = 3.0;

/// Why an intent was dropped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("stale sequence {sequence} (last applied {last_applied})")]
    StaleSequence { sequence: u64, last_applied: u64 },
    #[error("teleport: delta magnitude {magnitude:.2} exceeds {limit:.2}")]
    Teleport { magnitude: f64, limit: f64 },
    #[error("non-finite delta components")]
    NonFinite,
}

/// Which bound forced a clamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampKind {
    Speed,
    Bounds,
}

/// Outcome of validating one intent.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    /// Intent applied as-is.
    Accepted(Vec2),
    /// Intent modified before apply; the owning session gets a Correction.
    Clamped { delta: Vec2, kind: ClampKind },
    /// Intent dropped; `last_sequence` does not advance, but the owning
    /// session still gets a Correction to resynchronize.
    Rejected(RejectReason),
}

/// Validates intents and owns the motion constants for one world.
pub struct Validator {
    max_speed: f64,
    bounds: WorldBounds,
}

impl Validator {
    pub fn new(max_speed: f64, bounds: WorldBounds) -> Self {
        Self { max_speed, bounds }
    }

    /// Validation rules, in order. The teleport guard uses the original,
    /// unscaled magnitude; the speed clamp scales to exactly `max_speed`.
    pub fn validate(&self, entity: &Entity, intent: &MovementIntent) -> ValidationResult {
        if intent.sequence <= entity.last_sequence {
            return ValidationResult::Rejected(RejectReason::StaleSequence {
                sequence: intent.sequence,
                last_applied: entity.last_sequence,
            });
        }

        if !intent.delta.is_finite() {
            return ValidationResult::Rejected(RejectReason::NonFinite);
        }

        let magnitude = intent.delta.length();
        let teleport_limit = TELEPORT_FACTOR * self.max_speed;
        if magnitude > teleport_limit {
            return ValidationResult::Rejected(RejectReason::Teleport {
                magnitude,
                limit: teleport_limit,
            });
        }

        let mut delta = intent.delta;
        let mut clamp = None;
        if magnitude > self.max_speed {
            delta = delta.with_length(self.max_speed);
            clamp = Some(ClampKind::Speed);
        }

        if !self.bounds.contains(entity.position + delta) {
            delta = self.bounded_scale(entity.position, delta);
            clamp = Some(ClampKind::Bounds);
        }

        match clamp {
            None => ValidationResult::Accepted(delta),
            Some(kind) => ValidationResult::Clamped { delta, kind },
        }
    }

    /// Apply a validated delta: the delta becomes the entity's velocity for
    /// this tick's integration, rotation follows the heading, and the
    /// sequence advances.
    pub fn apply(&self, entity: &mut Entity, delta: Vec2, sequence: u64) {
        entity.velocity = delta;
        if delta != Vec2::ZERO {
            entity.rotation = delta.angle();
        }
        entity.last_sequence = sequence;
        entity.last_update_ms = now_ms();
    }

    /// Advance position by the current velocity (world units per tick).
    /// Returns true if the entity had to be clamped back inside the world,
    /// in which case its velocity is zeroed and a Correction is owed.
    pub fn integrate(&self, entity: &mut Entity) -> bool {
        if entity.velocity == Vec2::ZERO {
            return false;
        }
        entity.position += entity.velocity;
        entity.last_update_ms = now_ms();
        if self.bounds.contains(entity.position) {
            return false;
        }
        entity.position = self.bounds.clamp(entity.position);
        entity.velocity = Vec2::ZERO;
        true
    }

    /// Velocity decay between ticks.
    pub fn apply_friction(&self, entity: &mut Entity) {
        if entity.velocity != Vec2::ZERO {
            entity.velocity *= FRICTION;
        }
    }

    /// Largest scalar multiple of `delta` keeping `position + t*delta`
    /// inside the world rectangle.
    fn bounded_scale(&self, position: Vec2, delta: Vec2) -> Vec2 {
        let mut t: f64 = 1.0;
        if delta.x > 0.0 {
            t = t.min((self.bounds.max_x - position.x) / delta.x);
        } else if delta.x < 0.0 {
            t = t.min((self.bounds.min_x - position.x) / delta.x);
        }
        if delta.y > 0.0 {
            t = t.min((self.bounds.max_y - position.y) / delta.y);
        } else if delta.y < 0.0 {
            t = t.min((self.bounds.min_y - position.y) / delta.y);
        }
        delta * t.clamp(0.0, 1.0)
    }
}
