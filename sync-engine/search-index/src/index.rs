use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use task_queue::{CancellationToken, IdleHandler, QueueMode, TaskQueue};

use crate::error::SearchError;
use crate::events::{classify, EntityEvent};
use crate::orchestrator::{
    CleanupOutcome,
    Maintenance,
    NoopProgress,
    Progress,
    ReindexOutcome,
};
use crate::query::SearchQuery;
use crate::reader::{SearcherLease, SearcherManager};
use crate::storage::{Marker, StorageBackend};
use crate::store::EntityStore;
use crate::structures::{IndexContext, SearchHit, SyncContext};
use crate::tasks::{IndexingTask, TaskContext, TaskPayload};
use crate::work_log::{EntityIdsByEventType, OutstandingWorkLog};
use crate::writer::Writer;

type Result<T> = std::result::Result<T, SearchError>;

/// What happened while bringing the index up to date at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// Set when a pending full reindex was ran.
    pub reindexed: Option<ReindexOutcome>,

    /// Set when a pending cleanup was ran.
    pub cleaned: Option<CleanupOutcome>,

    /// The number of outstanding log entries replayed.
    pub replayed: usize,
}

#[derive(Clone)]
pub struct Index(Arc<InternalIndex>);

impl Index {
    /// Opens the index described by the context, mirroring the given store.
    pub fn open(ctx: IndexContext, store: Arc<dyn EntityStore>) -> anyhow::Result<Self> {
        let index = InternalIndex::open(ctx, store)?;
        Ok(Self(Arc::new(index)))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Honours any pending reindex or cleanup, then replays the outstanding
    /// work log and waits for the replay to complete.
    pub fn startup(&self) -> Result<StartupReport> {
        self.0.startup()
    }

    /// Records the index work implied by the events of a commit before
    /// the commit happens.
    ///
    /// A failure must fail the commit.
    pub fn record_commit(&self, events: &[EntityEvent]) -> Result<()> {
        self.0.record_commit(events)
    }

    /// Submits the indexing tasks for the events of a durable commit.
    pub fn handle_events(&self, events: &[EntityEvent]) -> Result<()> {
        self.0.handle_events(events)
    }

    /// Submits a single indexing task.
    pub fn submit(&self, task: IndexingTask) -> Result<()> {
        self.0.submit(task)
    }

    /// Waits for every task submitted so far to finish.
    pub fn drain(&self) -> Result<()> {
        self.0.drain()
    }

    /// Commits any pending changes, returning whether there were any.
    pub fn flush(&self) -> Result<bool> {
        self.0.flush()
    }

    /// Search the index for the given query.
    ///
    /// Every change flushed before the call is visible.
    pub fn search(&self, query: &SearchQuery, limit: usize) -> Result<Vec<SearchHit>> {
        self.0.search(query, limit)
    }

    /// Leases a searcher over the current state of the index.
    pub fn acquire_searcher(&self) -> Result<SearcherLease> {
        self.0.acquire_searcher()
    }

    /// The number of documents visible to a freshly acquired searcher.
    pub fn document_count(&self) -> Result<u64> {
        Ok(self.0.acquire_searcher()?.num_docs())
    }

    /// A copy of the work not yet confirmed as flushed.
    pub fn outstanding_work(&self) -> EntityIdsByEventType {
        self.0.writer.log().snapshot()
    }

    pub fn searchers(&self) -> &SearcherManager {
        &self.0.searchers
    }

    /// Rebuilds the index from the primary store.
    pub fn reindex_all(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<ReindexOutcome> {
        self.0.reindex_all(token, progress)
    }

    /// Removes documents whose entity no longer exists or is hidden.
    pub fn clean_up(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<CleanupOutcome> {
        self.0.clean_up(token, progress)
    }

    pub fn reindex_on_next_startup(&self) -> Result<()> {
        self.0.storage.set_marker(Marker::Reindex)?;
        Ok(())
    }

    pub fn clean_up_on_next_startup(&self) -> Result<()> {
        self.0.storage.set_marker(Marker::CleanUp)?;
        Ok(())
    }

    /// Removes every document and resets the outstanding work log.
    pub fn clear_index(&self) -> Result<()> {
        self.0.clear_index()
    }

    /// Shuts the index down.
    ///
    /// A graceful shutdown runs every queued task and commits, an emergency
    /// shutdown cancels queued tasks and commits nothing, leaving the
    /// outstanding work log to recover from on the next startup.
    pub fn shutdown(&self, emergency: bool) -> Result<()> {
        self.0.shutdown(emergency)
    }
}

struct InternalIndex {
    /// The name of the index.
    name: Arc<String>,

    /// The metadata store holding the log and control markers.
    storage: StorageBackend,

    writer: Arc<Writer>,
    searchers: Arc<SearcherManager>,
    queue: TaskQueue,
    tasks: Arc<TaskContext>,
    store: Arc<dyn EntityStore>,
    sync_ctx: SyncContext,
    is_shutdown: AtomicBool,
}

impl InternalIndex {
    #[instrument(name = "index-controller", skip(ctx, store), fields(index = %ctx.name))]
    fn open(ctx: IndexContext, store: Arc<dyn EntityStore>) -> anyhow::Result<Self> {
        let name = Arc::new(ctx.name.clone());

        let log = OutstandingWorkLog::load(ctx.storage.clone())?;
        let writer = Arc::new(Writer::create(&ctx, Arc::new(log))?);

        info!("creating searcher manager...");
        let searchers = Arc::new(SearcherManager::create(&ctx, writer.clone())?);

        let mode = if ctx.sync_ctx.synchronous {
            QueueMode::Inline
        } else {
            QueueMode::Background
        };

        let idle = match ctx.writer_ctx.auto_commit() {
            0 => None,
            secs => {
                let writer = writer.clone();
                let name = name.clone();
                Some(IdleHandler::new(Duration::from_secs(secs), move || {
                    info!("[ WRITER @ {} ] running auto commit", &name);
                    if let Err(e) = writer.flush_if_necessary() {
                        error!("[ WRITER @ {} ] auto commit failed: {:?}", &name, e);
                    }
                }))
            },
        };

        info!("starting task queue in {:?} mode...", mode);
        let queue = TaskQueue::create(&ctx.name, mode, idle)?;

        let tasks = Arc::new(TaskContext {
            index_name: name.clone(),
            writer: writer.clone(),
            store: store.clone(),
            batch_size: ctx.sync_ctx.task_batch_size,
        });

        Ok(Self {
            name,
            storage: ctx.storage.clone(),
            writer,
            searchers,
            queue,
            tasks,
            store,
            sync_ctx: ctx.sync_ctx,
            is_shutdown: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(SearchError::ShutDown);
        }

        Ok(())
    }

    fn maintenance(&self) -> Maintenance<'_> {
        Maintenance {
            index_name: &self.name,
            writer: &self.writer,
            searchers: &self.searchers,
            storage: &self.storage,
            store: self.store.as_ref(),
            sync_ctx: &self.sync_ctx,
        }
    }

    #[instrument(name = "index-startup", skip(self), fields(index = %self.name))]
    fn startup(&self) -> Result<StartupReport> {
        self.ensure_open()?;

        let token = self.queue.token();
        let mut report = StartupReport::default();

        if self.storage.has_marker(Marker::Reindex)? {
            info!("reindex marker found, rebuilding index");
            report.reindexed = Some(self.reindex_all(&token, &mut NoopProgress)?);
        } else if self.storage.has_marker(Marker::CleanUp)? {
            info!("cleanup marker found, pruning index");
            report.cleaned = Some(self.clean_up(&token, &mut NoopProgress)?);
        }

        let outstanding = self.writer.log().snapshot();
        if !outstanding.is_empty() {
            info!(
                "replaying outstanding work persisted={} updated={} removed={}",
                outstanding.persisted().len(),
                outstanding.updated().len(),
                outstanding.removed().len(),
            );

            // Persisted ids may already be indexed, replaying them as
            // updates never duplicates a document.
            let mut updates: Vec<_> = outstanding
                .persisted()
                .iter()
                .chain(outstanding.updated())
                .copied()
                .collect();
            updates.sort_unstable();

            if !updates.is_empty() {
                self.submit(IndexingTask::Update(TaskPayload::References(updates)))?;
            }

            if !outstanding.removed().is_empty() {
                self.submit(IndexingTask::Remove(outstanding.removed().to_vec()))?;
            }

            report.replayed = outstanding.len();
        }

        self.drain()?;
        self.flush()?;

        Ok(report)
    }

    fn record_commit(&self, events: &[EntityEvent]) -> Result<()> {
        self.ensure_open()?;

        let classified = classify(events);
        if classified.is_empty() {
            return Ok(());
        }

        let (persisted, updated, removed) = classified.ids();
        self.writer.log().record(&persisted, &updated, &removed)?;

        Ok(())
    }

    fn handle_events(&self, events: &[EntityEvent]) -> Result<()> {
        for task in classify(events).into_tasks() {
            self.submit(task)?;
        }

        Ok(())
    }

    fn submit(&self, task: IndexingTask) -> Result<()> {
        self.ensure_open()?;

        if task.is_empty() {
            return Ok(());
        }

        let wipe_epoch = self.writer.wipe_epoch();
        let tasks = self.tasks.clone();
        let name = format!("{}-{}", task.name(), task.len());

        self.queue
            .submit(name, move |token| {
                let kind = task.name();
                match tasks.execute(task, token, wipe_epoch) {
                    Ok(outcome) => {
                        debug!(
                            "[ TASKS @ {} ] {} task indexed={} missing={}",
                            &tasks.index_name,
                            kind,
                            outcome.indexed,
                            outcome.missing.len()
                        );
                        Ok(())
                    },
                    Err(e) if token.is_cancelled() => {
                        info!(
                            "[ TASKS @ {} ] {} task interrupted by cancellation: {}",
                            &tasks.index_name, kind, e
                        );
                        Ok(())
                    },
                    Err(e) => Err(e),
                }
            })
            .map_err(|e| {
                warn!("[ TASKS @ {} ] rejected task: {}", &self.name, e);
                SearchError::ShutDown
            })
    }

    fn drain(&self) -> Result<()> {
        self.queue.drain()?;
        Ok(())
    }

    fn flush(&self) -> Result<bool> {
        Ok(self.writer.flush_if_necessary()?)
    }

    fn search(&self, query: &SearchQuery, limit: usize) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        self.searchers.search(query, limit)
    }

    fn acquire_searcher(&self) -> Result<SearcherLease> {
        self.ensure_open()?;
        Ok(self.searchers.acquire()?)
    }

    fn reindex_all(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<ReindexOutcome> {
        self.ensure_open()?;
        Ok(self.maintenance().reindex_all(token, progress)?)
    }

    fn clean_up(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<CleanupOutcome> {
        self.ensure_open()?;
        Ok(self.maintenance().clean_up(token, progress)?)
    }

    fn clear_index(&self) -> Result<()> {
        self.ensure_open()?;

        let _guard = self.writer.maintenance_exclusive();
        self.writer.clear_index()?;
        self.searchers.dispose_all()?;

        Ok(())
    }

    #[instrument(name = "index-shutdown", skip(self), fields(index = %self.name))]
    fn shutdown(&self, emergency: bool) -> Result<()> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if emergency {
            warn!("running emergency shutdown");

            if let Err(e) = self.queue.shutdown(false) {
                warn!("failed to stop task queue: {:?}", e);
            }
            self.searchers.close(false)?;
            self.writer.shutdown(true)?;

            return Ok(());
        }

        info!("running graceful shutdown");
        self.queue.shutdown(true)?;
        self.writer.shutdown(false)?;
        self.searchers.close(true)?;

        Ok(())
    }
}
