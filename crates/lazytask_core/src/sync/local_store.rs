//! Local store adapter boundary.
//!
//! # Responsibility
//! - Describe the authoritative on-device entity storage the engine reads and
//!   writes through.
//! - Provide an in-memory implementation for hosts without their own store
//!   and for tests.
//!
//! # Invariants
//! - The engine never touches entity storage except through `LocalStore`.
//! - `delete` of a missing entity is not an error.

use crate::model::entity::{Entity, EntityId, EntityKind};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

pub type LocalStoreResult<T> = Result<T, LocalStoreError>;

/// Callback invoked after a local write with the affected kind and id.
pub type ChangeCallback = Arc<dyn Fn(EntityKind, EntityId) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalStoreError {
    /// The backing store is unavailable (locked, closed, poisoned).
    Unavailable(String),
    /// The store rejected the entity.
    Rejected { id: EntityId, message: String },
}

impl Display for LocalStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "local store unavailable: {message}"),
            Self::Rejected { id, message } => {
                write!(f, "local store rejected entity {id}: {message}")
            }
        }
    }
}

impl Error for LocalStoreError {}

/// Key-value access to each entity collection.
pub trait LocalStore: Send + Sync {
    fn get_all(&self, kind: EntityKind) -> LocalStoreResult<Vec<Entity>>;
    fn get(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<Option<Entity>>;
    fn upsert(&self, entity: &Entity) -> LocalStoreResult<()>;
    fn delete(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<()>;
    fn on_changed(&self, callback: ChangeCallback);
}

#[derive(Default)]
struct InMemoryState {
    collections: BTreeMap<EntityKind, BTreeMap<EntityId, Entity>>,
    write_count: u64,
}

/// Mutex-guarded in-memory `LocalStore`.
#[derive(Default)]
pub struct InMemoryLocalStore {
    state: Mutex<InMemoryState>,
    callbacks: Mutex<Vec<ChangeCallback>>,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `upsert`/`delete` calls that changed state.
    pub fn write_count(&self) -> u64 {
        self.state.lock().map(|state| state.write_count).unwrap_or(0)
    }

    fn notify(&self, kind: EntityKind, id: EntityId) {
        let callbacks = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(kind, id);
        }
    }
}

fn poisoned() -> LocalStoreError {
    LocalStoreError::Unavailable("in-memory store lock poisoned".to_string())
}

impl LocalStore for InMemoryLocalStore {
    fn get_all(&self, kind: EntityKind) -> LocalStoreResult<Vec<Entity>> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state
            .collections
            .get(&kind)
            .map(|collection| collection.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<Option<Entity>> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        Ok(state
            .collections
            .get(&kind)
            .and_then(|collection| collection.get(&id))
            .cloned())
    }

    fn upsert(&self, entity: &Entity) -> LocalStoreResult<()> {
        let kind = entity.kind();
        let id = entity.id();
        {
            let mut state = self.state.lock().map_err(|_| poisoned())?;
            state
                .collections
                .entry(kind)
                .or_default()
                .insert(id, entity.clone());
            state.write_count += 1;
        }
        self.notify(kind, id);
        Ok(())
    }

    fn delete(&self, kind: EntityKind, id: EntityId) -> LocalStoreResult<()> {
        let removed = {
            let mut state = self.state.lock().map_err(|_| poisoned())?;
            let removed = state
                .collections
                .get_mut(&kind)
                .and_then(|collection| collection.remove(&id))
                .is_some();
            if removed {
                state.write_count += 1;
            }
            removed
        };
        if removed {
            self.notify(kind, id);
        }
        Ok(())
    }

    fn on_changed(&self, callback: ChangeCallback) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InMemoryLocalStore, LocalStore};
    use crate::model::entity::{Entity, EntityKind, Task};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn upsert_get_and_delete() {
        let store = InMemoryLocalStore::new();
        let task = Task::new("water plants", 1);
        store.upsert(&Entity::Task(task.clone())).unwrap();

        let loaded = store.get(EntityKind::Task, task.id).unwrap();
        assert_eq!(loaded, Some(Entity::Task(task.clone())));
        assert_eq!(store.get_all(EntityKind::Task).unwrap().len(), 1);
        assert!(store.get_all(EntityKind::Reward).unwrap().is_empty());

        store.delete(EntityKind::Task, task.id).unwrap();
        assert!(store.get(EntityKind::Task, task.id).unwrap().is_none());
    }

    #[test]
    fn delete_missing_is_silent_and_not_counted() {
        let store = InMemoryLocalStore::new();
        store
            .delete(EntityKind::Task, uuid::Uuid::new_v4())
            .unwrap();
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn on_changed_fires_for_writes() {
        let store = InMemoryLocalStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = hits.clone();
        store.on_changed(Arc::new(move |kind, _id| {
            assert_eq!(kind, EntityKind::Task);
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        let task = Task::new("stretch", 1);
        store.upsert(&Entity::Task(task.clone())).unwrap();
        store.delete(EntityKind::Task, task.id).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
