use std::collections::BTreeMap;

use crate::structures::{EntityId, IndexableEntity};
use crate::tasks::{IndexingTask, TaskPayload};

/// A change committed to the primary store.
#[derive(Debug, Clone)]
pub enum EntityEvent {
    Added(IndexableEntity),
    Updated {
        old: IndexableEntity,
        new: IndexableEntity,
    },
    Removed(EntityId),
}

impl EntityEvent {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Self::Added(entity) => entity.id(),
            Self::Updated { new, .. } => new.id(),
            Self::Removed(id) => *id,
        }
    }
}

#[derive(Debug, Clone)]
enum Action {
    Persist(IndexableEntity),
    Update(IndexableEntity),
    Remove(EntityId),
}

/// Events of a commit sorted into the index operations they require.
#[derive(Debug, Default)]
pub struct ClassifiedEvents {
    pub persist: Vec<IndexableEntity>,
    pub update: Vec<IndexableEntity>,
    pub remove: Vec<EntityId>,
}

impl ClassifiedEvents {
    pub fn is_empty(&self) -> bool {
        self.persist.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }

    /// The affected ids per kind, in the order expected by the work log.
    pub fn ids(&self) -> (Vec<EntityId>, Vec<EntityId>, Vec<EntityId>) {
        (
            self.persist.iter().map(|e| e.id()).collect(),
            self.update.iter().map(|e| e.id()).collect(),
            self.remove.clone(),
        )
    }

    pub fn into_tasks(self) -> Vec<IndexingTask> {
        let mut tasks = Vec::with_capacity(3);
        if !self.persist.is_empty() {
            tasks.push(IndexingTask::Persist(TaskPayload::Entities(self.persist)));
        }

        if !self.update.is_empty() {
            tasks.push(IndexingTask::Update(TaskPayload::Entities(self.update)));
        }

        if !self.remove.is_empty() {
            tasks.push(IndexingTask::Remove(self.remove));
        }

        tasks
    }
}

fn classify_event(event: &EntityEvent) -> Option<Action> {
    match event {
        EntityEvent::Added(entity) if entity.is_visible() => Some(Action::Persist(entity.clone())),
        EntityEvent::Added(_) => None,
        EntityEvent::Updated { old, new } => match (old.is_visible(), new.is_visible()) {
            (true, true) => Some(Action::Update(new.clone())),
            (true, false) => Some(Action::Remove(new.id())),
            (false, true) => Some(Action::Persist(new.clone())),
            (false, false) => None,
        },
        EntityEvent::Removed(id) => Some(Action::Remove(*id)),
    }
}

/// Sorts the events of a commit into index operations.
///
/// The last event of an entity decides its operation. An entity touched
/// more than once is written as an update, so a document left behind by an
/// earlier operation is replaced rather than duplicated.
pub fn classify(events: &[EntityEvent]) -> ClassifiedEvents {
    let mut actions: BTreeMap<EntityId, Action> = BTreeMap::new();

    for event in events {
        let action = match classify_event(event) {
            Some(action) => action,
            None => continue,
        };

        let id = event.entity_id();
        let action = match (actions.contains_key(&id), action) {
            (true, Action::Persist(entity)) => Action::Update(entity),
            (_, action) => action,
        };

        actions.insert(id, action);
    }

    let mut classified = ClassifiedEvents::default();
    for action in actions.into_values() {
        match action {
            Action::Persist(entity) => classified.persist.push(entity),
            Action::Update(entity) => classified.update.push(entity),
            Action::Remove(id) => classified.remove.push(id),
        }
    }

    classified
}
