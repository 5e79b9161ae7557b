//! Engine: the process surface over the tick pipeline.
//!
//! Owns the entity store, session registry, broadcast dispatcher, intent
//! buffer and tick-side state, and drives the fixed-timestep scheduler
//! task. The gateway talks to the world exclusively through this handle;
//! there is no global mutable state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::net::broadcast::{BroadcastDispatcher, SendOutcome};
use crate::net::protocol::{encode, ServerMessage, REASON_REMOVED};
use crate::net::session::SessionRegistry;
use crate::sim::intent::{IntentBuffer, IntentError, MovementIntent};
use crate::sim::tick::{Pipeline, TickSummary};
use crate::world::entity::{Entity, EntityId, SessionId};
use crate::world::store::{EntityStore, SpawnError};

// Scheduler log cadence in ticks (~30 s at the default 25 ms period).
const LOG_EVERY_TICKS: u64 = 1200;

struct EngineInner {
    config: Config,
    store: EntityStore,
    sessions: SessionRegistry,
    dispatcher: BroadcastDispatcher,
    intents: IntentBuffer,
    pipeline: Mutex<Pipeline>,
    metrics: Arc<Metrics>,
    shutdown_tx: watch::Sender<bool>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

/// Clonable handle to the simulation core.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let inner = EngineInner {
            store: EntityStore::new(config.world_bounds, config.max_entities),
            sessions: SessionRegistry::new(config.heartbeat_timeout()),
            dispatcher: BroadcastDispatcher::new(config.outbound_queue_depth),
            intents: IntentBuffer::new(config.intent_buffer_capacity),
            pipeline: Mutex::new(Pipeline::new(&config)),
            metrics,
            shutdown_tx,
            tick_task: Mutex::new(None),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Spawn the fixed-timestep scheduler task. Missed deadlines are
    /// skipped, never queued; a tick that overruns half its period is
    /// reported but no phase is ever skipped.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let period = inner.config.tick_period();
            let mut clock = tokio::time::interval(period);
            clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(
                "tick scheduler started, period {} ms",
                inner.config.tick_period_ms
            );

            loop {
                tokio::select! {
                    _ = clock.tick() => {
                        let started = Instant::now();
                        let summary = run_tick(&inner);
                        let elapsed = started.elapsed();
                        inner.metrics.record_tick_time(elapsed);

                        if elapsed > period / 2 {
                            inner.metrics.tick_overruns.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "tick {} ran {:?}, over half the {:?} period",
                                summary.tick, elapsed, period
                            );
                        }

                        if summary.tick > 0 && summary.tick % LOG_EVERY_TICKS == 0 {
                            info!(
                                "tick {}: {} entities, {} sessions, {} intents, {} snapshots, {} corrections",
                                summary.tick,
                                inner.store.len(),
                                inner.sessions.len(),
                                summary.intents_processed,
                                summary.snapshots,
                                summary.corrections,
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            // In-progress tick has completed; close outbound queues so
            // writer tasks drain and exit.
            inner.dispatcher.close_all();
            info!("tick scheduler stopped");
        });

        *self.inner.tick_task.lock() = Some(handle);
    }

    /// Cooperative shutdown: the scheduler finishes the in-progress tick,
    /// closes every outbound queue, and exits.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self.inner.tick_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("tick task join error: {}", e);
            }
        }
    }

    /// Advance the simulation by exactly one tick without the scheduler.
    pub fn run_tick_once(&self) -> TickSummary {
        run_tick(&self.inner)
    }

    /// Install an entity. The spatial index picks it up at the next tick's
    /// rebuild.
    pub fn spawn_entity(
        &self,
        kind: &str,
        x: f64,
        y: f64,
        session: Option<SessionId>,
    ) -> Result<Entity, SpawnError> {
        let entity = self.inner.store.create(kind, x, y, session)?;
        if let Some(session) = session {
            self.inner.sessions.bind_entity(session, entity.id);
        }
        self.inner
            .metrics
            .entities_live
            .store(self.inner.store.len() as u64, Ordering::Relaxed);
        debug!(entity = entity.id, kind = kind, "entity spawned");
        Ok(entity)
    }

    /// Destroy an entity. Unknown ids are a no-op returning false. The
    /// owning session, if any, is told; other observers see the exit
    /// through their own AOI diffs on the next tick.
    pub fn remove_entity(&self, id: EntityId) -> bool {
        let owner = self.inner.store.get(id).and_then(|e| e.session);
        let removed = self.inner.store.remove(id);
        if removed {
            self.inner.pipeline.lock().forget_entity(id);
            if let Some(session) = owner {
                self.send_to(
                    session,
                    &ServerMessage::Despawn {
                        entity_id: id,
                        reason: REASON_REMOVED.to_string(),
                    },
                );
            }
            self.inner
                .metrics
                .entities_live
                .store(self.inner.store.len() as u64, Ordering::Relaxed);
            debug!(entity = id, "entity removed");
        }
        removed
    }

    /// Stage a movement intent for the next tick.
    pub fn process_movement_intent(&self, intent: MovementIntent) -> Result<(), IntentError> {
        self.inner
            .metrics
            .intents_received
            .fetch_add(1, Ordering::Relaxed);
        let result = self.inner.intents.try_submit(intent);
        if matches!(result, Err(IntentError::Full)) {
            self.inner.metrics.intents_shed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Snapshot of counters and gauges.
    pub fn stats(&self) -> HashMap<String, u64> {
        self.inner.metrics.snapshot()
    }

    /// Register a session and its outbound queue. The returned receiver is
    /// consumed by the session's writer task.
    pub fn connect_session(&self) -> (SessionId, mpsc::Receiver<Vec<u8>>) {
        let session = self.inner.sessions.register();
        let rx = self.inner.dispatcher.register(session);
        self.inner
            .metrics
            .connections_active
            .fetch_add(1, Ordering::Relaxed);
        (session, rx)
    }

    /// Transport closed: the session is reaped (queue closed, entity
    /// despawned) at the next tick boundary, not mid-tick.
    pub fn disconnect_session(&self, session: SessionId) {
        self.inner.sessions.mark_defunct(session);
        self.inner
            .metrics
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Heartbeat: reset the session's liveness deadline.
    pub fn touch_session(&self, session: SessionId) -> bool {
        self.inner.sessions.touch(session)
    }

    pub fn session_entity(&self, session: SessionId) -> Option<EntityId> {
        self.inner.sessions.entity_of(session)
    }

    pub fn record_session_sequence(&self, session: SessionId, sequence: u64) {
        self.inner.sessions.record_sequence(session, sequence);
    }

    /// Enqueue one message for a session, with the dispatcher's
    /// drop-newest backpressure.
    pub fn send_to(&self, session: SessionId, message: &ServerMessage) -> SendOutcome {
        let bytes = match encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(session = %session, "failed to encode message: {}", e);
                return SendOutcome::Closed;
            }
        };
        let outcome = self.inner.dispatcher.send_to(session, bytes);
        if outcome == SendOutcome::Dropped {
            self.inner
                .metrics
                .broadcast_drops
                .fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    pub fn entity_count(&self) -> usize {
        self.inner.store.len()
    }

    pub fn get_entity(&self, id: EntityId) -> Option<Entity> {
        self.inner.store.get(id)
    }
}

fn run_tick(inner: &EngineInner) -> TickSummary {
    let intents = inner.intents.drain();
    let mut pipeline = inner.pipeline.lock();
    pipeline.run(
        &inner.store,
        &inner.sessions,
        &inner.dispatcher,
        intents,
        &inner.metrics,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::decode;
    use crate::util::vec2::Vec2;

    fn engine() -> Engine {
        Engine::new(Config::default(), Arc::new(Metrics::new()))
    }

    fn movement(entity_id: EntityId, sequence: u64, dx: f64, dy: f64) -> MovementIntent {
        MovementIntent {
            entity_id,
            sequence,
            delta: Vec2::new(dx, dy),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_spawn_and_remove() {
        let engine = engine();
        let entity = engine.spawn_entity("player", 1.0, 2.0, None).unwrap();
        assert_eq!(engine.entity_count(), 1);
        assert_eq!(engine.get_entity(entity.id).unwrap().kind, "player");

        assert!(engine.remove_entity(entity.id));
        assert!(!engine.remove_entity(entity.id));
        assert_eq!(engine.entity_count(), 0);
    }

    #[test]
    fn test_remove_notifies_owning_session() {
        let engine = engine();
        let (session, mut rx) = engine.connect_session();
        let entity = engine
            .spawn_entity("player", 0.0, 0.0, Some(session))
            .unwrap();

        assert!(engine.remove_entity(entity.id));

        let bytes = rx.try_recv().unwrap();
        let message: ServerMessage = decode(&bytes).unwrap();
        match message {
            ServerMessage::Despawn { entity_id, reason } => {
                assert_eq!(entity_id, entity.id);
                assert_eq!(reason, REASON_REMOVED);
            }
            other => panic!("expected despawn, got {:?}", other),
        }
    }

    #[test]
    fn test_spawn_out_of_bounds_fails() {
        let engine = engine();
        let err = engine.spawn_entity("player", 5000.0, 0.0, None).unwrap_err();
        assert!(matches!(err, SpawnError::OutOfBounds { .. }));
    }

    #[test]
    fn test_intent_flows_through_tick() {
        let engine = engine();
        let entity = engine.spawn_entity("player", 0.0, 0.0, None).unwrap();

        engine
            .process_movement_intent(movement(entity.id, 1, 3.0, 0.0))
            .unwrap();
        engine.run_tick_once();

        let moved = engine.get_entity(entity.id).unwrap();
        assert!((moved.position.x - 3.0).abs() < 1e-9);
        assert_eq!(moved.last_sequence, 1);
    }

    #[test]
    fn test_session_lifecycle_through_engine() {
        let engine = engine();
        let (session, mut rx) = engine.connect_session();
        let entity = engine.spawn_entity("player", 0.0, 0.0, Some(session)).unwrap();
        assert_eq!(engine.session_entity(session), Some(entity.id));

        // A neighbor appears; the observer gets a snapshot on the tick.
        engine.spawn_entity("probe", 40.0, 0.0, None).unwrap();
        engine.run_tick_once();

        let bytes = rx.try_recv().unwrap();
        let message: ServerMessage = decode(&bytes).unwrap();
        assert!(matches!(message, ServerMessage::Snapshot(_)));

        // Transport drops; teardown happens at the next tick boundary.
        engine.disconnect_session(session);
        assert!(engine.get_entity(entity.id).is_some());
        engine.run_tick_once();
        assert!(engine.get_entity(entity.id).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_expired_session_reaped() {
        let mut config = Config::default();
        config.heartbeat_timeout_ms = 1;
        let engine = Engine::new(config, Arc::new(Metrics::new()));

        let (session, _rx) = engine.connect_session();
        let entity = engine.spawn_entity("player", 0.0, 0.0, Some(session)).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let summary = engine.run_tick_once();

        assert_eq!(summary.reaped_sessions, 1);
        assert!(engine.get_entity(entity.id).is_none());
    }

    #[test]
    fn test_heartbeat_keeps_session_alive() {
        let mut config = Config::default();
        config.heartbeat_timeout_ms = 50;
        let engine = Engine::new(config, Arc::new(Metrics::new()));

        let (session, _rx) = engine.connect_session();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(engine.touch_session(session));
        std::thread::sleep(std::time::Duration::from_millis(20));

        let summary = engine.run_tick_once();
        assert_eq!(summary.reaped_sessions, 0);
    }

    #[test]
    fn test_send_to_unknown_session_is_closed() {
        let engine = engine();
        let outcome = engine.send_to(
            uuid::Uuid::new_v4(),
            &ServerMessage::Heartbeat { client_id: 0 },
        );
        assert_eq!(outcome, SendOutcome::Closed);
    }

    #[test]
    fn test_stats_exposes_counters() {
        let engine = engine();
        engine.spawn_entity("player", 0.0, 0.0, None).unwrap();
        engine.run_tick_once();

        let stats = engine.stats();
        assert_eq!(stats["entities_live"], 1);
        assert!(stats.contains_key("tick_count"));
        assert!(stats.contains_key("broadcast_drops"));
    }

    #[tokio::test]
    async fn test_scheduler_runs_and_shuts_down() {
        let engine = engine();
        let (_session, mut rx) = engine.connect_session();
        engine.start();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        engine.shutdown().await;

        let ticked = engine.stats()["tick_count"];
        assert!(ticked >= 1, "scheduler never ticked");

        // Queues are closed after the final tick.
        assert!(rx.recv().await.is_none());
    }
}
