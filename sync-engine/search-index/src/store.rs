use std::collections::BTreeMap;

use anyhow::Result;
use parking_lot::RwLock;

use crate::structures::{EntityId, IndexableEntity};

pub type EntityIter<'a> = Box<dyn Iterator<Item = Result<IndexableEntity>> + Send + 'a>;

/// Read access to the primary store the index mirrors.
pub trait EntityStore: Send + Sync + 'static {
    fn exists_by_id(&self, id: EntityId) -> Result<bool>;

    fn load_by_id(&self, id: EntityId) -> Result<Option<IndexableEntity>>;

    /// Streams every entity of the store, hidden ones included.
    fn load_all(&self) -> Result<EntityIter<'_>>;
}

/// A primary store kept entirely in memory.
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: RwLock<BTreeMap<EntityId, IndexableEntity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entity, returning the previous version.
    pub fn insert(&self, entity: IndexableEntity) -> Option<IndexableEntity> {
        self.entities.write().insert(entity.id(), entity)
    }

    pub fn remove(&self, id: EntityId) -> Option<IndexableEntity> {
        self.entities.write().remove(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<IndexableEntity> {
        self.entities.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl EntityStore for MemoryEntityStore {
    fn exists_by_id(&self, id: EntityId) -> Result<bool> {
        Ok(self.entities.read().contains_key(&id))
    }

    fn load_by_id(&self, id: EntityId) -> Result<Option<IndexableEntity>> {
        Ok(self.get(id))
    }

    fn load_all(&self) -> Result<EntityIter<'_>> {
        let entities: Vec<IndexableEntity> = self.entities.read().values().cloned().collect();
        Ok(Box::new(entities.into_iter().map(Ok)))
    }
}
