use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use search_index::{
    CancellationToken,
    CleanupOutcome,
    EntityId,
    EntityIdsByEventType,
    EntityStore,
    Index,
    IndexDeclaration,
    IndexableEntity,
    Progress,
    ReindexOutcome,
    SearchHit,
    SearchQuery,
    SearcherLease,
    StartupReport,
};

use crate::error::EngineError;
use crate::listener::{CommitListener, DispatchOp};

type Result<T> = std::result::Result<T, EngineError>;

/// Keeps a search index in sync with a primary entity store.
///
/// Events of durable commits are delivered through a `CommitListener`
/// and turned into indexing tasks by a dedicated dispatcher thread.
pub struct Engine {
    index: Index,
    store: Arc<dyn EntityStore>,
    events: Sender<DispatchOp>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,

    /// Set by an emergency shutdown, queued events are discarded.
    aborted: Arc<AtomicBool>,
    is_shutdown: AtomicBool,
}

impl Engine {
    /// Opens the declared index and starts the event dispatcher.
    ///
    /// Events handed over before `startup` are dispatched straight away,
    /// the replay run by `startup` indexes them again as updates.
    #[instrument(name = "engine-create", skip_all, fields(index = %declaration.name()))]
    pub fn create(declaration: &IndexDeclaration, store: Arc<dyn EntityStore>) -> Result<Self> {
        let ctx = declaration
            .create_context()
            .map_err(EngineError::StartupError)?;
        let index = Index::open(ctx, store.clone()).map_err(EngineError::StartupError)?;

        let (tx, rx) = channel::unbounded();
        let aborted = Arc::new(AtomicBool::new(false));

        let dispatcher = Dispatcher {
            index: index.clone(),
            events: rx,
            aborted: aborted.clone(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("event-dispatcher-{}", index.name()))
            .spawn(move || dispatcher.run())
            .map_err(|e| EngineError::StartupError(e.into()))?;

        Ok(Self {
            index,
            store,
            events: tx,
            dispatcher: Mutex::new(Some(handle)),
            aborted,
            is_shutdown: AtomicBool::new(false),
        })
    }

    /// Runs any pending reindex or cleanup and replays the outstanding
    /// work left behind by the previous run.
    pub fn startup(&self) -> Result<StartupReport> {
        Ok(self.index.startup()?)
    }

    #[inline]
    pub fn index(&self) -> &Index {
        &self.index
    }

    /// The hooks to register with the primary store's commit path.
    pub fn listener(&self) -> CommitListener {
        CommitListener::new(self.index.clone(), self.events.clone())
    }

    /// Waits until every event handed over so far has been indexed.
    pub fn wait_for_events(&self) -> Result<()> {
        let (tx, rx) = channel::bounded(1);
        self.events
            .send(DispatchOp::Barrier(tx))
            .map_err(|_| EngineError::DispatcherStopped)?;
        rx.recv().map_err(|_| EngineError::DispatcherStopped)?;

        self.index.drain()?;
        Ok(())
    }

    /// Loads the entity straight from the primary store.
    ///
    /// Unlike a search this always reflects the latest commit, whether or
    /// not it has been indexed yet.
    pub fn find_committed(&self, id: EntityId) -> Result<Option<IndexableEntity>> {
        self.store.load_by_id(id).map_err(EngineError::StoreError)
    }

    pub fn search(&self, query: &SearchQuery, limit: usize) -> Result<Vec<SearchHit>> {
        Ok(self.index.search(query, limit)?)
    }

    pub fn acquire_searcher(&self) -> Result<SearcherLease> {
        Ok(self.index.acquire_searcher()?)
    }

    pub fn document_count(&self) -> Result<u64> {
        Ok(self.index.document_count()?)
    }

    pub fn outstanding_work(&self) -> EntityIdsByEventType {
        self.index.outstanding_work()
    }

    /// Commits any pending index changes.
    pub fn flush(&self) -> Result<bool> {
        Ok(self.index.flush()?)
    }

    pub fn reindex_all(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<ReindexOutcome> {
        Ok(self.index.reindex_all(token, progress)?)
    }

    pub fn clean_up(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<CleanupOutcome> {
        Ok(self.index.clean_up(token, progress)?)
    }

    pub fn reindex_on_next_startup(&self) -> Result<()> {
        Ok(self.index.reindex_on_next_startup()?)
    }

    pub fn clean_up_on_next_startup(&self) -> Result<()> {
        Ok(self.index.clean_up_on_next_startup()?)
    }

    pub fn clear_index(&self) -> Result<()> {
        Ok(self.index.clear_index()?)
    }

    /// Stops the dispatcher and shuts the index down.
    ///
    /// A graceful shutdown dispatches every queued event first, an
    /// emergency shutdown discards them. Discarded work stays in the
    /// outstanding work log and is replayed on the next startup.
    #[instrument(name = "engine-shutdown", skip(self), fields(index = %self.index.name()))]
    pub fn shutdown(&self, emergency: bool) -> Result<()> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if emergency {
            self.aborted.store(true, Ordering::Release);
        }

        // The dispatcher may already be gone.
        let _ = self.events.send(DispatchOp::Shutdown);
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                error!("[ DISPATCHER @ {} ] dispatcher thread panicked", self.index.name());
            }
        }

        self.index.shutdown(emergency)?;

        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_shutdown.load(Ordering::Acquire) {
            return;
        }

        if let Err(e) = self.shutdown(false) {
            warn!(
                "[ DISPATCHER @ {} ] failed to shut down engine cleanly: {}",
                self.index.name(),
                e
            );
        }
    }
}

struct Dispatcher {
    index: Index,
    events: Receiver<DispatchOp>,
    aborted: Arc<AtomicBool>,
}

impl Dispatcher {
    fn run(self) {
        let id = std::thread::current().id();
        info!(
            "[ DISPATCHER @ {} ] dispatcher thread started with id {:?}",
            self.index.name(),
            id
        );

        while let Ok(op) = self.events.recv() {
            match op {
                DispatchOp::Events(events) => {
                    if self.aborted.load(Ordering::Acquire) {
                        continue;
                    }

                    if let Err(e) = self.index.handle_events(&events) {
                        error!(
                            "[ DISPATCHER @ {} ] failed to dispatch {} events: {}",
                            self.index.name(),
                            events.len(),
                            e
                        );
                    }
                },
                DispatchOp::Barrier(done) => {
                    let _ = done.send(());
                },
                DispatchOp::Shutdown => break,
            }
        }

        info!("[ DISPATCHER @ {} ] dispatcher thread stopped", self.index.name());
    }
}

#[cfg(test)]
mod tests {
    use search_index::{EntityEvent, FieldValue, MemoryEntityStore};

    use super::*;

    fn init_state() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn create_engine(store: Arc<MemoryEntityStore>) -> Result<Engine> {
        init_state();

        let declaration: IndexDeclaration = serde_json::from_value(serde_json::json!({
            "name": "engine-test",
            "storage_type": "memory",
            "writer_buffer": 15_000_000,
            "writer_threads": 1,
            "fields": {
                "title": { "type": "text", "stored": true },
            },
        }))
        .expect("valid declaration");

        Engine::create(&declaration, store)
    }

    fn note(id: EntityId, title: &str) -> IndexableEntity {
        IndexableEntity::new(id).with_field("title", FieldValue::Text(title.to_string()))
    }

    #[test]
    fn committed_events_reach_the_index() -> Result<()> {
        let store = Arc::new(MemoryEntityStore::new());
        let engine = create_engine(store.clone())?;
        engine.startup()?;

        let listener = engine.listener();
        let events = vec![
            EntityEvent::Added(note(1, "first note")),
            EntityEvent::Added(note(2, "second note")),
        ];

        listener.before_commit(&events)?;
        store.insert(note(1, "first note"));
        store.insert(note(2, "second note"));
        assert_eq!(engine.outstanding_work().persisted().len(), 2);

        // Committed but not yet indexed.
        assert!(engine.find_committed(2)?.is_some());

        listener.after_commit(events)?;
        engine.wait_for_events()?;

        let hits = engine.search(
            &SearchQuery::Text {
                field: "title".into(),
                text: "note".into(),
            },
            10,
        )?;
        assert_eq!(hits.len(), 2);
        assert!(engine.outstanding_work().is_empty());

        engine.shutdown(false)?;
        Ok(())
    }

    #[test]
    fn listener_fails_once_engine_stopped() -> Result<()> {
        let store = Arc::new(MemoryEntityStore::new());
        let engine = create_engine(store)?;
        engine.startup()?;

        let listener = engine.listener();
        engine.shutdown(false)?;

        let res = listener.after_commit(vec![EntityEvent::Removed(1)]);
        assert!(matches!(res, Err(EngineError::DispatcherStopped)));

        let res = listener.before_commit(&[EntityEvent::Removed(1)]);
        assert!(matches!(res, Err(EngineError::SearchError(_))));

        assert!(matches!(
            engine.wait_for_events(),
            Err(EngineError::DispatcherStopped)
        ));
        Ok(())
    }

    #[test]
    fn events_before_startup_are_not_duplicated_by_replay() -> Result<()> {
        let store = Arc::new(MemoryEntityStore::new());
        let engine = create_engine(store.clone())?;

        let listener = engine.listener();
        let events = vec![EntityEvent::Added(note(1, "early note"))];
        listener.before_commit(&events)?;
        store.insert(note(1, "early note"));
        listener.after_commit(events)?;

        engine.wait_for_events()?;
        assert_eq!(engine.document_count()?, 1);

        engine.startup()?;
        assert_eq!(engine.document_count()?, 1);
        assert!(engine.outstanding_work().is_empty());

        engine.shutdown(false)?;
        Ok(())
    }

    #[test]
    fn find_committed_misses_unknown_entities() -> Result<()> {
        let store = Arc::new(MemoryEntityStore::new());
        let engine = create_engine(store.clone())?;
        store.insert(note(3, "stored"));

        assert_eq!(engine.find_committed(3)?, Some(note(3, "stored")));
        assert_eq!(engine.find_committed(4)?, None);

        engine.shutdown(false)?;
        Ok(())
    }
}
