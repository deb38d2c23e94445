use std::sync::Arc;

use anyhow::{Error, Result};
use tantivy::collector::DocSetCollector;
use tantivy::query::AllQuery;
use task_queue::CancellationToken;

use crate::reader::SearcherManager;
use crate::storage::{Marker, StorageBackend};
use crate::store::EntityStore;
use crate::structures::{EntityId, IndexableEntity, SyncContext};
use crate::writer::Writer;

/// Receives progress updates of long running maintenance operations.
pub trait Progress {
    /// Called once before any work, with the total units of work when known.
    fn begin(&mut self, _total: Option<usize>) {}

    fn worked(&mut self, _units: usize) {}

    fn done(&mut self) {}
}

/// Discards every progress update.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopProgress;

impl Progress for NoopProgress {}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ReindexOutcome {
    /// The number of documents written.
    pub indexed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    /// The number of documents checked against the primary store.
    pub scanned: usize,

    /// The number of documents deleted.
    pub removed: usize,
    pub cancelled: bool,
}

/// Full reindexing and cleanup of an index.
///
/// Both run with exclusive access to the index, indexing tasks wait
/// until they finished.
pub(crate) struct Maintenance<'a> {
    pub(crate) index_name: &'a str,
    pub(crate) writer: &'a Writer,
    pub(crate) searchers: &'a Arc<SearcherManager>,
    pub(crate) storage: &'a StorageBackend,
    pub(crate) store: &'a dyn EntityStore,
    pub(crate) sync_ctx: &'a SyncContext,
}

impl<'a> Maintenance<'a> {
    /// Removes every document, assumes the maintenance section is held.
    pub(crate) fn wipe(&self) -> Result<()> {
        self.writer.clear_index()?;

        if let Err(e) = self.searchers.dispose_all() {
            warn!(
                "[ MAINTENANCE @ {} ] searchers outlived the index wipe: {:?}",
                self.index_name, e
            );
        }

        Ok(())
    }

    /// Rebuilds the index from every visible entity of the primary store.
    ///
    /// The reindex marker stays set unless the rebuild completes, so an
    /// interrupted rebuild starts over on the next startup.
    #[instrument(name = "reindex", skip_all, fields(index = %self.index_name))]
    pub(crate) fn reindex_all(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<ReindexOutcome> {
        let _guard = self.writer.maintenance_exclusive();

        self.storage.set_marker(Marker::Reindex)?;
        self.wipe()?;

        info!("[ MAINTENANCE @ {} ] starting full reindex", self.index_name);
        progress.begin(None);

        let chunk_size = self.sync_ctx.chunk_size;
        let mut outcome = ReindexOutcome::default();
        let mut chunk: Vec<IndexableEntity> = Vec::with_capacity(chunk_size);
        let mut chunks_written = 0;

        for entity in self.store.load_all()? {
            if token.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let entity = entity?;
            if !entity.is_visible() {
                continue;
            }

            chunk.push(entity);
            if chunk.len() < chunk_size {
                continue;
            }

            outcome.indexed += self.writer.index(&chunk, false, false)?;
            progress.worked(chunk.len());
            chunk.clear();

            chunks_written += 1;
            if chunks_written % self.sync_ctx.flush_every_chunks == 0 {
                self.writer.flush_if_necessary()?;
            }
        }

        if !outcome.cancelled && token.is_cancelled() {
            outcome.cancelled = true;
        }

        if !outcome.cancelled && !chunk.is_empty() {
            outcome.indexed += self.writer.index(&chunk, false, false)?;
            progress.worked(chunk.len());
        }

        self.writer.flush_if_necessary()?;
        progress.done();

        if outcome.cancelled {
            warn!(
                "[ MAINTENANCE @ {} ] reindex cancelled after {} documents, it will restart on next startup",
                self.index_name, outcome.indexed
            );
            return Ok(outcome);
        }

        self.storage.clear_marker(Marker::Reindex)?;
        self.storage.clear_marker(Marker::CleanUp)?;

        info!(
            "[ MAINTENANCE @ {} ] reindex complete, {} documents indexed",
            self.index_name, outcome.indexed
        );

        Ok(outcome)
    }

    /// Removes every document whose entity no longer exists or is hidden.
    #[instrument(name = "cleanup", skip_all, fields(index = %self.index_name))]
    pub(crate) fn clean_up(
        &self,
        token: &CancellationToken,
        progress: &mut dyn Progress,
    ) -> Result<CleanupOutcome> {
        let _guard = self.writer.maintenance_exclusive();

        self.storage.set_marker(Marker::CleanUp)?;
        self.writer.flush_if_necessary()?;

        let ids = self.indexed_ids()?;

        info!(
            "[ MAINTENANCE @ {} ] checking {} documents against the store",
            self.index_name,
            ids.len()
        );
        progress.begin(Some(ids.len()));

        let mut outcome = CleanupOutcome::default();
        let mut to_remove = vec![];
        for id in ids {
            if token.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let keep = self
                .store
                .load_by_id(id)?
                .map(|entity| entity.is_visible())
                .unwrap_or(false);

            if !keep {
                to_remove.push(id);
            }

            outcome.scanned += 1;
            progress.worked(1);
        }

        self.writer.remove_from_index(&to_remove, false)?;
        self.writer.flush_if_necessary()?;
        outcome.removed = to_remove.len();
        progress.done();

        if !outcome.cancelled {
            self.storage.clear_marker(Marker::CleanUp)?;
        }

        info!(
            "[ MAINTENANCE @ {} ] cleanup scanned {} documents and removed {} (cancelled={})",
            self.index_name, outcome.scanned, outcome.removed, outcome.cancelled
        );

        Ok(outcome)
    }

    /// The distinct entity ids of every document, in ascending order.
    fn indexed_ids(&self) -> Result<Vec<EntityId>> {
        let searcher = self.searchers.acquire()?;
        let id_field = searcher.schema().get_field(crate::schema::PRIMARY_KEY).ok_or_else(|| {
            Error::msg("expected index primary key to exist, the index is corrupted.")
        })?;

        let addresses = searcher.search(&AllQuery, &DocSetCollector)?;

        let mut ids = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc = searcher.doc(address)?;
            if let Some(id) = doc.get_first(id_field).and_then(|v| v.as_u64()) {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        ids.dedup();

        Ok(ids)
    }
}
