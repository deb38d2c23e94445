#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use engine::search_index::{
    EntityEvent,
    EntityId,
    FieldValue,
    IndexDeclaration,
    IndexableEntity,
    MemoryEntityStore,
    SearchHit,
};
use engine::{Engine, EngineError};

pub fn init_state() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn base_declaration(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "storage_type": "memory",
        "writer_buffer": 15_000_000,
        "writer_threads": 1,
        "synchronous": true,
        "fields": {
            "title": { "type": "text", "stored": true },
            "status": { "type": "keyword", "stored": true },
        },
    })
}

fn merge(mut base: serde_json::Value, extra: serde_json::Value) -> serde_json::Value {
    if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            base.insert(key.clone(), value.clone());
        }
    }
    base
}

pub fn memory_declaration(name: &str, extra: serde_json::Value) -> IndexDeclaration {
    serde_json::from_value(merge(base_declaration(name), extra)).expect("valid declaration")
}

pub fn filesystem_declaration(name: &str, base_path: &Path) -> IndexDeclaration {
    let extra = serde_json::json!({
        "storage_type": "filesystem",
        "base_path": base_path,
    });
    serde_json::from_value(merge(base_declaration(name), extra)).expect("valid declaration")
}

pub fn open(
    declaration: &IndexDeclaration,
    store: &Arc<MemoryEntityStore>,
) -> Result<Engine, EngineError> {
    init_state();
    Engine::create(declaration, store.clone())
}

pub fn ticket(id: EntityId, title: &str) -> IndexableEntity {
    IndexableEntity::new(id)
        .with_field("title", FieldValue::Text(title.to_string()))
        .with_field("status", FieldValue::Keyword("open".to_string()))
}

/// Applies the events to the store the way a committing store would.
pub fn apply(store: &MemoryEntityStore, events: &[EntityEvent]) {
    for event in events {
        match event {
            EntityEvent::Added(entity) => {
                store.insert(entity.clone());
            },
            EntityEvent::Updated { new, .. } => {
                store.insert(new.clone());
            },
            EntityEvent::Removed(id) => {
                store.remove(*id);
            },
        }
    }
}

/// Runs a full commit through the engine's listener and waits for it to
/// be indexed.
pub fn commit(
    engine: &Engine,
    store: &MemoryEntityStore,
    events: Vec<EntityEvent>,
) -> Result<(), EngineError> {
    let listener = engine.listener();
    listener.before_commit(&events)?;
    apply(store, &events);
    listener.after_commit(events)?;
    engine.wait_for_events()
}

pub fn sorted_ids(hits: &[SearchHit]) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = hits.iter().map(|hit| hit.entity_id).collect();
    ids.sort_unstable();
    ids
}
