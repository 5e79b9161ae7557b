//! Phase-ordered tick pipeline.
//!
//! One `Pipeline::run` is one tick: reap dead sessions, drain and apply
//! buffered intents, integrate motion, rebuild the spatial index, compute
//! per-observer AOI broadcasts, emit corrections. The pipeline owns the
//! quadtree, the AOI memory and the validator; the entity store, session
//! registry and dispatcher are shared with the I/O side and passed in.

use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::net::broadcast::{BroadcastDispatcher, SendOutcome};
use crate::net::protocol::{
    encode, Correction, EntityState, MovementDelta, ServerMessage, WorldSnapshot, REASON_OUT_OF_AOI,
};
use crate::net::session::SessionRegistry;
use crate::sim::authority::{ValidationResult, Validator};
use crate::sim::intent::MovementIntent;
use crate::util::vec2::Vec2;
use crate::world::aoi::AoiTracker;
use crate::world::entity::{Entity, EntityId, SessionId};
use crate::world::quadtree::{Aabb, QuadEntry, Quadtree};
use crate::world::store::EntityStore;

/// What one tick did, for telemetry and the periodic log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSummary {
    pub tick: u64,
    pub reaped_sessions: usize,
    pub intents_processed: usize,
    pub corrections: usize,
    pub snapshots: usize,
    pub despawns: usize,
    pub dropped: usize,
}

/// A correction owed to a session, materialized from post-integration
/// state at the end of the tick.
struct PendingCorrection {
    session: SessionId,
    entity_id: EntityId,
    ack: u64,
}

/// Tick-owned state: spatial index, AOI memory, validator, tick counter.
pub struct Pipeline {
    index: Quadtree,
    aoi: AoiTracker,
    validator: Validator,
    aoi_radius: f64,
    tick: u64,
}

impl Pipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            index: Quadtree::new(
                Aabb::from_bounds(&config.world_bounds),
                config.quadtree_capacity,
                config.quadtree_max_depth,
            ),
            aoi: AoiTracker::new(),
            validator: Validator::new(config.max_speed, config.world_bounds),
            aoi_radius: config.aoi_radius,
            tick: 0,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Drop tick-side state for a destroyed entity. Its former neighbors
    /// still see it exit through their own diffs on the next tick.
    pub fn forget_entity(&mut self, id: EntityId) {
        self.aoi.forget(id);
    }

    /// Run one tick over the shared state.
    pub fn run(
        &mut self,
        store: &EntityStore,
        sessions: &SessionRegistry,
        dispatcher: &BroadcastDispatcher,
        intents: Vec<MovementIntent>,
        metrics: &Metrics,
    ) -> TickSummary {
        use std::sync::atomic::Ordering;

        let mut summary = TickSummary {
            tick: self.tick,
            ..Default::default()
        };

        // Phase 0: tear down sessions whose transport closed or whose
        // liveness deadline passed. Only ever at a tick boundary.
        let reaped = sessions.reap(Instant::now());
        for (session, entity_id) in &reaped {
            dispatcher.close(*session);
            if *entity_id != 0 && store.remove(*entity_id) {
                self.aoi.forget(*entity_id);
            }
            debug!(session = %session, entity = entity_id, "session reaped");
        }
        summary.reaped_sessions = reaped.len();
        metrics
            .sessions_reaped
            .fetch_add(reaped.len() as u64, Ordering::Relaxed);

        // Phase 1: group the drained intents per entity, ordered by
        // client sequence.
        summary.intents_processed = intents.len();
        let mut per_entity: HashMap<EntityId, Vec<MovementIntent>> = HashMap::new();
        for intent in intents {
            per_entity.entry(intent.entity_id).or_default().push(intent);
        }
        for list in per_entity.values_mut() {
            list.sort_by_key(|i| i.sequence);
        }

        // Phase 2: validate and apply. Clamped and rejected intents each
        // owe exactly one correction, materialized after integration.
        let mut pending: Vec<PendingCorrection> = Vec::new();
        let mut applied = 0u64;
        let mut clamped = 0u64;
        let mut rejected = 0u64;
        for (entity_id, list) in per_entity {
            let outcome = store.with_entity_mut(entity_id, |entity| {
                let mut owed = Vec::new();
                for intent in &list {
                    match self.validator.validate(entity, intent) {
                        ValidationResult::Accepted(delta) => {
                            self.validator.apply(entity, delta, intent.sequence);
                            applied += 1;
                        }
                        ValidationResult::Clamped { delta, .. } => {
                            self.validator.apply(entity, delta, intent.sequence);
                            clamped += 1;
                            if let Some(session) = entity.session {
                                owed.push(PendingCorrection {
                                    session,
                                    entity_id: entity.id,
                                    ack: intent.sequence,
                                });
                            }
                        }
                        ValidationResult::Rejected(reason) => {
                            rejected += 1;
                            debug!(entity = entity.id, %reason, "intent rejected");
                            if let Some(session) = entity.session {
                                owed.push(PendingCorrection {
                                    session,
                                    entity_id: entity.id,
                                    ack: entity.last_sequence,
                                });
                            }
                        }
                    }
                }
                owed
            });
            match outcome {
                Some(owed) => pending.extend(owed),
                // The entity despawned between staging and the tick.
                None => debug!(entity = entity_id, "intents for unknown entity dropped"),
            }
        }
        metrics.intents_applied.fetch_add(applied, Ordering::Relaxed);
        metrics.intents_clamped.fetch_add(clamped, Ordering::Relaxed);
        metrics
            .intents_rejected
            .fetch_add(rejected, Ordering::Relaxed);

        // Phase 3: advance positions by the per-tick velocity, clamping
        // strays back inside the world, then decay velocity for the next
        // tick.
        store.for_each_mut(|entity| {
            if self.validator.integrate(entity) {
                if let Some(session) = entity.session {
                    pending.push(PendingCorrection {
                        session,
                        entity_id: entity.id,
                        ack: entity.last_sequence,
                    });
                }
            }
            self.validator.apply_friction(entity);
        });

        // Phase 4: rebuild the spatial index from the post-move snapshot.
        let world = store.snapshot();
        self.index.rebuild(world.iter().map(|e| QuadEntry {
            id: e.id,
            position: e.position,
        }));

        // Phase 5: per-observer AOI broadcasts.
        let by_id: HashMap<EntityId, &Entity> = world.iter().map(|e| (e.id, e)).collect();
        for observer in world.iter() {
            let Some(session) = observer.session else {
                continue;
            };

            let neighbors = self.index.query_radius(observer.position, self.aoi_radius);
            let current: Vec<(EntityId, Vec2)> = neighbors
                .iter()
                .filter(|n| n.id != observer.id)
                .map(|n| (n.id, n.position))
                .collect();

            let diff = self.aoi.diff(observer.id, &current);

            if !diff.entered.is_empty() || !diff.moved.is_empty() {
                let snapshot = WorldSnapshot {
                    entities: diff
                        .entered
                        .iter()
                        .filter_map(|id| by_id.get(id))
                        .map(|e| EntityState::from_entity(e))
                        .collect(),
                    deltas: diff
                        .moved
                        .iter()
                        .filter_map(|id| by_id.get(id))
                        .map(|e| MovementDelta {
                            entity_id: e.id,
                            sequence: e.last_sequence,
                            dx: e.position.x as f32,
                            dy: e.position.y as f32,
                            timestamp_ms: e.last_update_ms,
                        })
                        .collect(),
                };
                if self.dispatch(
                    dispatcher,
                    metrics,
                    session,
                    &ServerMessage::Snapshot(snapshot),
                    &mut summary,
                ) {
                    summary.snapshots += 1;
                    metrics.snapshots_sent.fetch_add(1, Ordering::Relaxed);
                }
            }

            for id in &diff.exited {
                let msg = ServerMessage::Despawn {
                    entity_id: *id,
                    reason: REASON_OUT_OF_AOI.to_string(),
                };
                if self.dispatch(dispatcher, metrics, session, &msg, &mut summary) {
                    summary.despawns += 1;
                    metrics.despawns_sent.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.aoi.commit(observer.id, &current);
        }

        // Phase 6: corrections, from post-integration state.
        for owed in pending {
            let Some(entity) = by_id.get(&owed.entity_id) else {
                continue;
            };
            let msg = ServerMessage::Correction(Correction::from_entity(entity, owed.ack));
            if self.dispatch(dispatcher, metrics, owed.session, &msg, &mut summary) {
                summary.corrections += 1;
                metrics.corrections_sent.fetch_add(1, Ordering::Relaxed);
            }
        }

        metrics
            .entities_live
            .store(store.len() as u64, Ordering::Relaxed);
        metrics
            .sessions_active
            .store(sessions.len() as u64, Ordering::Relaxed);

        self.tick += 1;
        summary
    }

    /// Encode and enqueue one message. Returns true if the message was
    /// queued; a full queue drops the message and only bumps counters.
    fn dispatch(
        &self,
        dispatcher: &BroadcastDispatcher,
        metrics: &Metrics,
        session: SessionId,
        message: &ServerMessage,
        summary: &mut TickSummary,
    ) -> bool {
        use std::sync::atomic::Ordering;

        let bytes = match encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session = %session, "failed to encode outbound message: {}", e);
                return false;
            }
        };
        match dispatcher.send_to(session, bytes) {
            SendOutcome::Sent => true,
            SendOutcome::Dropped => {
                summary.dropped += 1;
                metrics.broadcast_drops.fetch_add(1, Ordering::Relaxed);
                false
            }
            SendOutcome::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::decode;
    use crate::sim::authority::FRICTION;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tokio::sync::mpsc::Receiver;

    struct Harness {
        store: EntityStore,
        sessions: SessionRegistry,
        dispatcher: BroadcastDispatcher,
        metrics: Metrics,
        pipeline: Pipeline,
    }

    impl Harness {
        // World −1000…+1000, 25 ms period, max_speed 5.0, aoi_radius 100.
        fn new() -> Self {
            Self::with_queue_depth(64)
        }

        fn with_queue_depth(depth: usize) -> Self {
            let mut config = Config::default();
            config.outbound_queue_depth = depth;
            Self {
                store: EntityStore::new(config.world_bounds, config.max_entities),
                sessions: SessionRegistry::new(config.heartbeat_timeout()),
                dispatcher: BroadcastDispatcher::new(config.outbound_queue_depth),
                metrics: Metrics::new(),
                pipeline: Pipeline::new(&config),
            }
        }

        fn connect(&self) -> (SessionId, Receiver<Vec<u8>>) {
            let session = self.sessions.register();
            let rx = self.dispatcher.register(session);
            (session, rx)
        }

        fn spawn(&self, x: f64, y: f64, session: Option<SessionId>) -> Entity {
            let entity = self.store.create("probe", x, y, session).unwrap();
            if let Some(session) = session {
                self.sessions.bind_entity(session, entity.id);
            }
            entity
        }

        fn run(&mut self, intents: Vec<MovementIntent>) -> TickSummary {
            self.pipeline.run(
                &self.store,
                &self.sessions,
                &self.dispatcher,
                intents,
                &self.metrics,
            )
        }

        fn place(&self, id: EntityId, x: f64, y: f64) {
            self.store.with_entity_mut(id, |e| {
                e.position = Vec2::new(x, y);
                e.velocity = Vec2::ZERO;
            });
        }
    }

    fn recv_all(rx: &mut Receiver<Vec<u8>>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            out.push(decode(&bytes).unwrap());
        }
        out
    }

    fn intent(entity_id: EntityId, sequence: u64, dx: f64, dy: f64) -> MovementIntent {
        MovementIntent {
            entity_id,
            sequence,
            delta: Vec2::new(dx, dy),
            timestamp_ms: sequence * 25,
        }
    }

    #[test]
    fn test_initial_snapshots_are_symmetric() {
        // S1: two observers spawn at (0,0) and (50,0); after one idle tick
        // each receives exactly one full state, for the other entity.
        let mut h = Harness::new();
        let (session_a, mut rx_a) = h.connect();
        let (session_b, mut rx_b) = h.connect();
        let a = h.spawn(0.0, 0.0, Some(session_a));
        let b = h.spawn(50.0, 0.0, Some(session_b));

        h.run(vec![]);

        for (rx, expected_id, expected_x) in
            [(&mut rx_a, b.id, 50.0), (&mut rx_b, a.id, 0.0)]
        {
            let messages = recv_all(rx);
            assert_eq!(messages.len(), 1);
            match &messages[0] {
                ServerMessage::Snapshot(snapshot) => {
                    assert_eq!(snapshot.entities.len(), 1);
                    assert_eq!(snapshot.entities[0].entity_id, expected_id);
                    assert_eq!(snapshot.entities[0].x, expected_x);
                    assert!(snapshot.deltas.is_empty());
                }
                other => panic!("expected snapshot, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_static_world_is_silent() {
        // If nothing moves between two ticks, the second tick broadcasts
        // nothing at all.
        let mut h = Harness::new();
        let (session_a, mut rx_a) = h.connect();
        let (session_b, mut rx_b) = h.connect();
        h.spawn(0.0, 0.0, Some(session_a));
        h.spawn(50.0, 0.0, Some(session_b));

        h.run(vec![]);
        recv_all(&mut rx_a);
        recv_all(&mut rx_b);

        let summary = h.run(vec![]);
        assert!(recv_all(&mut rx_a).is_empty());
        assert!(recv_all(&mut rx_b).is_empty());
        assert_eq!(summary.snapshots, 0);
        assert_eq!(summary.corrections, 0);
    }

    #[test]
    fn test_speed_clamp_applies_and_corrects() {
        // S2: intent {seq=1, dx=10} is clamped to exactly 5 along +X; after
        // integration the entity sits at (5,0) and one correction carries
        // the post-clamp state with ack_sequence 1.
        let mut h = Harness::new();
        let (session, mut rx) = h.connect();
        let e = h.spawn(0.0, 0.0, Some(session));

        let summary = h.run(vec![intent(e.id, 1, 10.0, 0.0)]);

        let entity = h.store.get(e.id).unwrap();
        assert!((entity.position.x - 5.0).abs() < 1e-9);
        assert_eq!(entity.position.y, 0.0);
        assert_eq!(entity.last_sequence, 1);

        let messages = recv_all(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(summary.corrections, 1);
        match &messages[0] {
            ServerMessage::Correction(c) => {
                assert!((c.x - 5.0).abs() < 1e-9);
                assert_eq!(c.y, 0.0);
                assert_eq!(c.ack_sequence, 1);
                // Post-tick velocity has one friction step applied.
                assert!((c.vx - 5.0 * crate::sim::authority::FRICTION).abs() < 1e-9);
            }
            other => panic!("expected correction, got {:?}", other),
        }
    }

    #[test]
    fn test_teleport_rejected_without_sequence_advance() {
        // S3: dx=50 exceeds 3*max_speed; the entity does not move,
        // last_sequence stays 0, and one correction acks 0.
        let mut h = Harness::new();
        let (session, mut rx) = h.connect();
        let e = h.spawn(0.0, 0.0, Some(session));

        let summary = h.run(vec![intent(e.id, 1, 50.0, 0.0)]);

        let entity = h.store.get(e.id).unwrap();
        assert_eq!(entity.position, Vec2::ZERO);
        assert_eq!(entity.last_sequence, 0);
        assert_eq!(summary.corrections, 1);

        let messages = recv_all(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Correction(c) => {
                assert_eq!(c.x, 0.0);
                assert_eq!(c.y, 0.0);
                assert_eq!(c.ack_sequence, 0);
            }
            other => panic!("expected correction, got {:?}", other),
        }
    }

    #[test]
    fn test_integration_clamp_at_world_edge() {
        // S4: an entity at (999,0) carrying velocity (5,0) is clamped to
        // (1000,0) with velocity zeroed and one correction emitted.
        let mut h = Harness::new();
        let (session, mut rx) = h.connect();
        let e = h.spawn(999.0, 0.0, Some(session));
        h.store
            .with_entity_mut(e.id, |e| e.velocity = Vec2::new(5.0, 0.0));

        let summary = h.run(vec![]);

        let entity = h.store.get(e.id).unwrap();
        assert_eq!(entity.position, Vec2::new(1000.0, 0.0));
        assert_eq!(entity.velocity, Vec2::ZERO);
        assert_eq!(summary.corrections, 1);

        let messages = recv_all(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Correction(c) => {
                assert_eq!(c.x, 1000.0);
                assert_eq!(c.vx, 0.0);
            }
            other => panic!("expected correction, got {:?}", other),
        }
    }

    #[test]
    fn test_aoi_enter_move_exit_lifecycle() {
        // S5: a neighbor at (90,0) enters the observer's AOI, moves to
        // (95,0) producing a delta, leaves at (110,0) producing a despawn,
        // then is never mentioned again.
        let mut h = Harness::new();
        let (session, mut rx) = h.connect();
        let _observer = h.spawn(0.0, 0.0, Some(session));
        let neighbor = h.spawn(90.0, 0.0, None);

        h.run(vec![]);
        let messages = recv_all(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Snapshot(s) => {
                assert_eq!(s.entities.len(), 1);
                assert_eq!(s.entities[0].entity_id, neighbor.id);
            }
            other => panic!("tick N: expected entered snapshot, got {:?}", other),
        }

        h.place(neighbor.id, 95.0, 0.0);
        h.run(vec![]);
        let messages = recv_all(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Snapshot(s) => {
                assert!(s.entities.is_empty());
                assert_eq!(s.deltas.len(), 1);
                assert_eq!(s.deltas[0].entity_id, neighbor.id);
                assert_eq!(s.deltas[0].dx, 95.0);
            }
            other => panic!("tick N+1: expected movement delta, got {:?}", other),
        }

        h.place(neighbor.id, 110.0, 0.0);
        h.run(vec![]);
        let messages = recv_all(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Despawn { entity_id, reason } => {
                assert_eq!(*entity_id, neighbor.id);
                assert_eq!(reason, REASON_OUT_OF_AOI);
            }
            other => panic!("tick N+2: expected despawn, got {:?}", other),
        }

        h.run(vec![]);
        assert!(recv_all(&mut rx).is_empty());
    }

    #[test]
    fn test_full_queue_drops_newest_without_disconnect() {
        // S6: queue depth 2, three messages in one tick. The third is
        // dropped, the drop counter increments, the session stays open.
        let mut h = Harness::with_queue_depth(2);
        let (session, mut rx) = h.connect();
        h.spawn(0.0, 0.0, Some(session));
        let neighbors: Vec<EntityId> = (0..3)
            .map(|i| h.spawn(10.0 + i as f64, 0.0, None).id)
            .collect();

        h.run(vec![]);
        recv_all(&mut rx);

        // All three neighbors vanish: three despawns owed this tick.
        for id in &neighbors {
            h.store.remove(*id);
            h.pipeline.forget_entity(*id);
        }
        let summary = h.run(vec![]);

        assert_eq!(summary.despawns, 2);
        assert_eq!(summary.dropped, 1);
        assert_eq!(h.dispatcher.drops(session), 1);
        assert_eq!(recv_all(&mut rx).len(), 2);

        // Session survives the drop.
        assert_eq!(h.sessions.len(), 1);
        assert_eq!(h.dispatcher.len(), 1);
    }

    #[test]
    fn test_last_sequence_is_max_of_accepted() {
        // Intents are applied in ascending sequence order regardless of
        // staging order; the entity ends at the maximum accepted sequence.
        let mut h = Harness::new();
        let (session, _rx) = h.connect();
        let e = h.spawn(0.0, 0.0, Some(session));

        h.run(vec![
            intent(e.id, 3, 1.0, 0.0),
            intent(e.id, 1, 1.0, 0.0),
            intent(e.id, 2, 1.0, 0.0),
        ]);
        assert_eq!(h.store.get(e.id).unwrap().last_sequence, 3);

        // A replayed sequence is stale and leaves the counter alone.
        let summary = h.run(vec![intent(e.id, 2, 1.0, 0.0)]);
        assert_eq!(h.store.get(e.id).unwrap().last_sequence, 3);
        assert_eq!(summary.corrections, 1);
    }

    #[test]
    fn test_positions_never_leave_bounds() {
        // Property: whatever intents arrive, every entity is inside the
        // world rectangle after every tick.
        let mut h = Harness::new();
        let mut rng = StdRng::seed_from_u64(99);

        let ids: Vec<EntityId> = (0..20)
            .map(|_| {
                h.spawn(
                    rng.gen_range(-990.0..=990.0),
                    rng.gen_range(-990.0..=990.0),
                    None,
                )
                .id
            })
            .collect();

        let mut sequence = 0u64;
        for _ in 0..30 {
            let intents: Vec<MovementIntent> = ids
                .iter()
                .map(|&id| {
                    sequence += 1;
                    intent(
                        id,
                        sequence,
                        rng.gen_range(-20.0..=20.0),
                        rng.gen_range(-20.0..=20.0),
                    )
                })
                .collect();
            h.run(intents);

            let bounds = Config::default().world_bounds;
            for entity in h.store.snapshot() {
                assert!(
                    bounds.contains(entity.position),
                    "entity {} escaped to {:?}",
                    entity.id,
                    entity.position
                );
            }
        }
    }

    #[test]
    fn test_defunct_session_reaped_at_tick_boundary() {
        let mut h = Harness::new();
        let (session, mut rx) = h.connect();
        let e = h.spawn(0.0, 0.0, Some(session));

        h.sessions.mark_defunct(session);
        let summary = h.run(vec![]);

        assert_eq!(summary.reaped_sessions, 1);
        assert!(h.store.get(e.id).is_none());
        assert!(h.sessions.is_empty());
        assert!(h.dispatcher.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_intents_for_unknown_entity_are_telemetry_only() {
        let mut h = Harness::new();
        let summary = h.run(vec![intent(404, 1, 1.0, 0.0)]);
        assert_eq!(summary.intents_processed, 1);
        assert_eq!(summary.corrections, 0);
    }

    #[test]
    fn test_npc_clamp_produces_no_correction() {
        // Entities without an owning session move under authority but have
        // nowhere to send corrections.
        let mut h = Harness::new();
        let e = h.spawn(0.0, 0.0, None);

        let summary = h.run(vec![intent(e.id, 1, 10.0, 0.0)]);

        assert!((h.store.get(e.id).unwrap().position.x - 5.0).abs() < 1e-9);
        assert_eq!(summary.corrections, 0);
    }

    #[test]
    fn test_friction_decays_idle_entities_across_ticks() {
        let mut h = Harness::new();
        let e = h.spawn(0.0, 0.0, None);

        h.run(vec![intent(e.id, 1, 4.0, 0.0)]);
        let after_one = h.store.get(e.id).unwrap();
        assert!((after_one.position.x - 4.0).abs() < 1e-9);

        // No renewed intent: the next tick moves by the decayed velocity.
        h.run(vec![]);
        let after_two = h.store.get(e.id).unwrap();
        assert!((after_two.position.x - (4.0 + 4.0 * FRICTION)).abs() < 1e-9);
    }
}

