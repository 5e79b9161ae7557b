//! Authoritative entity store.
//!
//! Keyed by entity id and by owning session. Lookups run concurrently;
//! mutations are exclusive and, during a tick, belong to the tick alone.

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::config::WorldBounds;
use crate::util::vec2::Vec2;
use crate::world::entity::{Entity, EntityId, SessionId};

/// Why a spawn was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpawnError {
    #[error("spawn position ({x}, {y}) outside world bounds")]
    OutOfBounds { x: f64, y: f64 },
    #[error("entity capacity reached ({limit})")]
    AtCapacity { limit: usize },
    #[error("session already owns entity {entity_id}")]
    AlreadySpawned { entity_id: EntityId },
}

struct StoreInner {
    entities: HashMap<EntityId, Entity>,
    by_session: HashMap<SessionId, EntityId>,
    next_id: EntityId,
}

/// Authoritative map of live entities.
pub struct EntityStore {
    inner: RwLock<StoreInner>,
    bounds: WorldBounds,
    max_entities: usize,
}

impl EntityStore {
    pub fn new(bounds: WorldBounds, max_entities: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                entities: HashMap::new(),
                by_session: HashMap::new(),
                next_id: 0,
            }),
            bounds,
            max_entities,
        }
    }

    /// Install a new entity. Ids are assigned monotonically, skipping 0.
    pub fn create(
        &self,
        kind: &str,
        x: f64,
        y: f64,
        session: Option<SessionId>,
    ) -> Result<Entity, SpawnError> {
        let position = Vec2::new(x, y);
        if !self.bounds.contains(position) {
            return Err(SpawnError::OutOfBounds { x, y });
        }

        let mut inner = self.inner.write();
        if inner.entities.len() >= self.max_entities {
            return Err(SpawnError::AtCapacity {
                limit: self.max_entities,
            });
        }
        if let Some(session) = session {
            if let Some(&existing) = inner.by_session.get(&session) {
                return Err(SpawnError::AlreadySpawned {
                    entity_id: existing,
                });
            }
        }

        inner.next_id = inner.next_id.wrapping_add(1);
        if inner.next_id == 0 {
            inner.next_id = 1;
        }
        let id = inner.next_id;

        let entity = Entity::new(id, kind, position, session);
        if let Some(session) = session {
            inner.by_session.insert(session, id);
        }
        inner.entities.insert(id, entity.clone());
        Ok(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.inner.read().entities.get(&id).cloned()
    }

    pub fn get_by_session(&self, session: SessionId) -> Option<Entity> {
        let inner = self.inner.read();
        let id = inner.by_session.get(&session)?;
        inner.entities.get(id).cloned()
    }

    /// Remove an entity. Unknown ids are a no-op returning false.
    pub fn remove(&self, id: EntityId) -> bool {
        let mut inner = self.inner.write();
        match inner.entities.remove(&id) {
            Some(entity) => {
                if let Some(session) = entity.session {
                    inner.by_session.remove(&session);
                }
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entities.is_empty()
    }

    /// Clone of every live entity, in unspecified order.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.inner.read().entities.values().cloned().collect()
    }

    /// Exclusive mutation of one entity. Used by the tick only.
    pub fn with_entity_mut<R>(&self, id: EntityId, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        let mut inner = self.inner.write();
        inner.entities.get_mut(&id).map(f)
    }

    /// Exclusive mutation sweep over every entity. Used by the tick only.
    pub fn for_each_mut(&self, mut f: impl FnMut(&mut Entity)) {
        let mut inner = self.inner.write();
        for entity in inner.entities.values_mut() {
            f(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn store() -> EntityStore {
        EntityStore::new(WorldBounds::centered(1000.0), 16)
    }

    #[test]
    fn test_create_assigns_monotonic_ids() {
        let store = store();
        let a = store.create("probe", 0.0, 0.0, None).unwrap();
        let b = store.create("probe", 1.0, 1.0, None).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_create_out_of_bounds() {
        let store = store();
        let err = store.create("probe", 1500.0, 0.0, None).unwrap_err();
        assert!(matches!(err, SpawnError::OutOfBounds { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_create_at_capacity() {
        let store = EntityStore::new(WorldBounds::centered(1000.0), 2);
        store.create("probe", 0.0, 0.0, None).unwrap();
        store.create("probe", 1.0, 0.0, None).unwrap();
        let err = store.create("probe", 2.0, 0.0, None).unwrap_err();
        assert_eq!(err, SpawnError::AtCapacity { limit: 2 });
    }

    #[test]
    fn test_one_entity_per_session() {
        let store = store();
        let session = Uuid::new_v4();
        let first = store.create("player", 0.0, 0.0, Some(session)).unwrap();
        let err = store.create("player", 5.0, 5.0, Some(session)).unwrap_err();
        assert_eq!(
            err,
            SpawnError::AlreadySpawned {
                entity_id: first.id
            }
        );
    }

    #[test]
    fn test_get_by_session() {
        let store = store();
        let session = Uuid::new_v4();
        let created = store.create("player", 3.0, 4.0, Some(session)).unwrap();
        let fetched = store.get_by_session(session).unwrap();
        assert_eq!(fetched.id, created.id);
        assert!(store.get_by_session(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_remove_clears_session_index() {
        let store = store();
        let session = Uuid::new_v4();
        let entity = store.create("player", 0.0, 0.0, Some(session)).unwrap();

        assert!(store.remove(entity.id));
        assert!(store.get_by_session(session).is_none());

        // Session can spawn again after removal.
        assert!(store.create("player", 0.0, 0.0, Some(session)).is_ok());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let store = store();
        assert!(!store.remove(999));
    }

    #[test]
    fn test_with_entity_mut() {
        let store = store();
        let entity = store.create("probe", 0.0, 0.0, None).unwrap();

        store.with_entity_mut(entity.id, |e| {
            e.position = Vec2::new(9.0, 9.0);
            e.last_sequence = 4;
        });

        let read_back = store.get(entity.id).unwrap();
        assert_eq!(read_back.position, Vec2::new(9.0, 9.0));
        assert_eq!(read_back.last_sequence, 4);
        assert!(store.with_entity_mut(999, |_| ()).is_none());
    }

    #[test]
    fn test_for_each_mut_and_snapshot() {
        let store = store();
        for i in 0..4 {
            store.create("probe", i as f64, 0.0, None).unwrap();
        }

        store.for_each_mut(|e| e.position.y = 7.0);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.iter().all(|e| e.position.y == 7.0));
    }
}
