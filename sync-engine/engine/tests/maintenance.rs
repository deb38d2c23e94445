mod common;

use std::sync::Arc;

use engine::search_index::{
    CancellationToken,
    EntityEvent,
    MemoryEntityStore,
    NoopProgress,
    Progress,
    SearchQuery,
};
use engine::EngineError;

use common::*;

#[derive(Default)]
struct CountingProgress {
    total: Option<usize>,
    worked: usize,
    finished: bool,
}

impl Progress for CountingProgress {
    fn begin(&mut self, total: Option<usize>) {
        self.total = total;
    }

    fn worked(&mut self, units: usize) {
        self.worked += units;
    }

    fn done(&mut self) {
        self.finished = true;
    }
}

fn populated_store(visible: u64, hidden: u64) -> Arc<MemoryEntityStore> {
    let store = Arc::new(MemoryEntityStore::new());
    for id in 0..visible {
        store.insert(ticket(id, "Visible ticket"));
    }
    for id in 1_000..1_000 + hidden {
        store.insert(ticket(id, "Hidden ticket").hidden());
    }
    store
}

#[test]
fn reindex_is_deterministic_across_chunk_sizes() -> Result<(), EngineError> {
    let expected: Vec<u64> = (0..23).collect();

    for chunk_size in [1usize, 4, 7, 23, 500].iter() {
        let store = populated_store(23, 9);
        let declaration = memory_declaration(
            "reindex",
            serde_json::json!({ "chunk_size": chunk_size, "flush_every_chunks": 2 }),
        );

        let engine = open(&declaration, &store)?;
        let report = engine.startup()?;
        assert_eq!(report.reindexed.map(|r| r.indexed), Some(23));

        let hits = engine.search(&SearchQuery::All, 100)?;
        assert_eq!(sorted_ids(&hits), expected, "chunk size {}", chunk_size);

        let mut progress = CountingProgress::default();
        let outcome = engine.reindex_all(&CancellationToken::new(), &mut progress)?;
        assert_eq!(outcome.indexed, 23);
        assert!(!outcome.cancelled);
        assert_eq!(progress.worked, 23);
        assert!(progress.finished);
        assert_eq!(engine.document_count()?, 23);

        engine.shutdown(false)?;
    }

    Ok(())
}

#[test]
fn cancelled_reindex_reports_cancellation() -> Result<(), EngineError> {
    let store = populated_store(10, 0);
    let engine = open(&memory_declaration("cancelled", serde_json::json!({})), &store)?;
    engine.startup()?;

    let token = CancellationToken::new();
    token.cancel();

    let outcome = engine.reindex_all(&token, &mut NoopProgress)?;
    assert!(outcome.cancelled);
    assert_eq!(outcome.indexed, 0);
    assert_eq!(engine.document_count()?, 0);

    engine.shutdown(false)?;
    Ok(())
}

#[test]
fn cleanup_removes_exactly_the_vanished_documents() -> Result<(), EngineError> {
    let store = populated_store(6, 0);
    let engine = open(&memory_declaration("cleanup", serde_json::json!({})), &store)?;
    engine.startup()?;
    assert_eq!(engine.document_count()?, 6);

    // Changes made behind the engine's back.
    store.remove(1);
    store.remove(4);
    store.insert(ticket(5, "Now hidden").hidden());

    let mut progress = CountingProgress::default();
    let outcome = engine.clean_up(&CancellationToken::new(), &mut progress)?;
    assert_eq!(outcome.scanned, 6);
    assert_eq!(outcome.removed, 3);
    assert!(!outcome.cancelled);
    assert_eq!(progress.total, Some(6));
    assert_eq!(progress.worked, 6);

    let hits = engine.search(&SearchQuery::All, 10)?;
    assert_eq!(sorted_ids(&hits), vec![0, 2, 3]);

    engine.shutdown(false)?;
    Ok(())
}

#[test]
fn clearing_the_index_discards_queued_work() -> Result<(), EngineError> {
    let store = Arc::new(MemoryEntityStore::new());
    let engine = open(&memory_declaration("clearing", serde_json::json!({})), &store)?;
    engine.startup()?;

    commit(&engine, &store, vec![
        EntityEvent::Added(ticket(1, "Soon cleared")),
        EntityEvent::Added(ticket(2, "Soon cleared")),
    ])?;
    assert_eq!(engine.document_count()?, 2);

    let listener = engine.listener();
    listener.before_commit(&[EntityEvent::Removed(2)])?;
    assert!(!engine.outstanding_work().is_empty());

    engine.clear_index()?;
    assert_eq!(engine.document_count()?, 0);
    assert!(engine.outstanding_work().is_empty());

    engine.shutdown(false)?;
    Ok(())
}

#[test]
fn searchers_never_see_stale_data() -> Result<(), EngineError> {
    let store = Arc::new(MemoryEntityStore::new());
    let engine = open(&memory_declaration("fresh-reads", serde_json::json!({})), &store)?;
    engine.startup()?;

    let before = engine.acquire_searcher()?;
    commit(&engine, &store, vec![EntityEvent::Added(ticket(1, "Fresh ticket"))])?;

    let after = engine.acquire_searcher()?;
    assert_eq!(before.num_docs(), 0);
    assert_eq!(after.num_docs(), 1);
    assert!(after.handle().generation() > before.handle().generation());

    let handle = before.handle().clone();
    drop(before);
    assert!(handle.is_disposed());
    assert_eq!(handle.ref_count(), 0);

    drop(after);
    engine.shutdown(false)?;
    Ok(())
}
