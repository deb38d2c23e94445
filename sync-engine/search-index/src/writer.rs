use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Error, Result};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use sysinfo::SystemExt;
use tantivy::schema::Field;
use tantivy::{IndexWriter, Term};

use crate::error::SearchError;
use crate::helpers::Validate;
use crate::mapper::DocumentMapper;
use crate::structures::{EntityId, IndexContext, IndexableEntity};
use crate::work_log::{EventKind, OutstandingWorkLog};

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub(crate) struct WriterContext {
    /// The amount of bytes to allocate to the writer buffer.
    #[serde(default)]
    writer_buffer: usize,

    /// The amount of worker threads to dedicate to a writer.
    #[serde(default = "defaults::default_writer_threads")]
    writer_threads: usize,

    /// The auto-commit duration, if no documents have been added within this period
    /// then the system will automatically commit and index them. In Seconds.
    #[serde(default)]
    auto_commit: u64,
}

mod defaults {
    /// The max number of threads to default to.
    ///
    /// If the cpu count is higher than this, it will not go beyond this
    /// value.
    const MAX_DEFAULT_THREAD_COUNT: usize = 8;

    /// Size of the margin for the heap. A segment is closed when the remaining memory
    /// in the heap goes below MARGIN_IN_BYTES.
    pub const MARGIN_IN_BYTES: usize = 1_000_000;

    /// We impose the memory per thread to be at least 3 MB.
    pub const HEAP_SIZE_MIN: usize = ((MARGIN_IN_BYTES as u32) * 3u32) as usize;
    pub const HEAP_SIZE_MAX: usize = u32::MAX as usize - MARGIN_IN_BYTES;

    /// The default amount of writer threads to use if left out of
    /// the index declaration.
    pub fn default_writer_threads() -> usize {
        num_cpus::get().min(MAX_DEFAULT_THREAD_COUNT)
    }
}

impl WriterContext {
    #[inline]
    pub(crate) fn auto_commit(&self) -> u64 {
        self.auto_commit
    }

    /// Computes a target buffer size if it's bellow the minimum
    /// required size.
    ///
    /// This tries to allocate 10% of the total memory of the system
    /// otherwise defaulting to the minimum required buffer size should it
    /// be bellow the minimum or above the amount of free memory.
    fn with_safe_buffer(&self) -> Result<WriterContext> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        // sysinfo reports memory in KB.
        let total_mem = sys.total_memory() as usize * 1_000;
        let free_mem = sys.free_memory() as usize * 1_000;

        let num_threads = self.writer_threads;
        let mut buffer = self.writer_buffer;

        let min_buffer = defaults::HEAP_SIZE_MIN * num_threads;
        if buffer < min_buffer {
            let target_buffer_size = ((total_mem as f64 * 0.10) as usize).max(min_buffer);

            if free_mem < target_buffer_size {
                info!(
                    "target buffer size of {}KB cannot be reached due \
                    to not enough free memory, defaulting to {}KB",
                    target_buffer_size / 1_000,
                    min_buffer / 1_000,
                );

                buffer = min_buffer;
            } else {
                buffer = target_buffer_size;
            }
        }

        buffer = buffer.min(defaults::HEAP_SIZE_MAX * num_threads);

        if buffer > free_mem {
            return Err(Error::msg(format!(
                "cannot allocate {}KB due to system not having enough free memory. (Free: {}KB)",
                buffer / 1_000,
                free_mem / 1_000,
            )));
        }

        Ok(Self {
            writer_threads: num_threads,
            writer_buffer: buffer,
            auto_commit: self.auto_commit,
        })
    }
}

impl Validate for WriterContext {
    fn validate(&self) -> Result<()> {
        if self.writer_threads == 0 {
            return Err(Error::msg(
                "writer threads bellow minimum. Threads must be at least 1.",
            ));
        }

        Ok(())
    }
}

/// The single point of mutation of an index.
///
/// Every write goes through the tantivy writer held behind a mutex, so
/// mutations are serialized. Tracked writes are recorded into the
/// outstanding work log before touching the index and are only dropped
/// from it once a flush made them durable.
pub(crate) struct Writer {
    index_name: Arc<String>,
    writer: Mutex<Option<IndexWriter>>,
    mapper: DocumentMapper,
    id_field: Field,
    log: Arc<OutstandingWorkLog>,

    /// Set by every mutation, cleared by the flush which commits it.
    flush_required: AtomicBool,

    /// Bumped by every commit, searchers opened at an older generation
    /// are stale.
    generation: AtomicU64,

    /// Bumped by every wipe of the index.
    wipe_epoch: AtomicU64,

    /// Held shared by indexing tasks and exclusively by full reindexing
    /// and cleanup.
    maintenance: RwLock<()>,
}

impl Writer {
    /// Creates the tantivy index writer with the configured number of
    /// threads and memory budget.
    pub(crate) fn create(ctx: &IndexContext, log: Arc<OutstandingWorkLog>) -> Result<Self> {
        let writer_ctx = ctx.writer_ctx.with_safe_buffer()?;

        debug!(
            "[ WRITER @ {} ] index writer setup threads={}, heap={}B",
            &ctx.name, writer_ctx.writer_threads, writer_ctx.writer_buffer,
        );

        let writer = ctx
            .index
            .writer_with_num_threads(writer_ctx.writer_threads, writer_ctx.writer_buffer)?;

        info!("[ WRITER @ {} ] writer ready", &ctx.name);

        Ok(Self {
            index_name: Arc::new(ctx.name.clone()),
            writer: Mutex::new(Some(writer)),
            mapper: DocumentMapper::new(ctx.fields.clone()),
            id_field: ctx.fields.id_field(),
            log,
            flush_required: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            wipe_epoch: AtomicU64::new(0),
            maintenance: RwLock::new(()),
        })
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn wipe_epoch(&self) -> u64 {
        self.wipe_epoch.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.writer.lock().is_some()
    }

    #[inline]
    pub(crate) fn log(&self) -> &OutstandingWorkLog {
        &self.log
    }

    pub(crate) fn maintenance_shared(&self) -> RwLockReadGuard<()> {
        self.maintenance.read()
    }

    pub(crate) fn maintenance_exclusive(&self) -> RwLockWriteGuard<()> {
        self.maintenance.write()
    }

    /// Writes the entities to the index, returning the number of documents
    /// added.
    ///
    /// Entities are handled most recent first and only the last occurrence
    /// of an id is written. Updates delete the existing document first,
    /// hidden entities are never added.
    pub(crate) fn index(
        &self,
        entities: &[IndexableEntity],
        is_update: bool,
        track_in_log: bool,
    ) -> Result<usize> {
        let mut seen = HashSet::with_capacity(entities.len());
        let batch: Vec<&IndexableEntity> = entities
            .iter()
            .rev()
            .filter(|entity| seen.insert(entity.id()))
            .collect();

        if batch.is_empty() {
            return Ok(0);
        }

        let kind = if is_update {
            EventKind::Update
        } else {
            EventKind::Persist
        };
        let ids: Vec<EntityId> = batch.iter().map(|entity| entity.id()).collect();

        let sequence = if track_in_log {
            let sequence = match kind {
                EventKind::Update => self.log.record(&[], &ids, &[])?,
                _ => self.log.record(&ids, &[], &[])?,
            };
            Some(sequence)
        } else {
            None
        };

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(SearchError::ShutDown)?;

        let mut added = 0;
        for entity in batch {
            if is_update {
                writer.delete_term(Term::from_field_u64(self.id_field, entity.id()));
            }

            if !entity.is_visible() {
                continue;
            }

            match self.mapper.map_to_document(entity) {
                Some(doc) => {
                    writer.add_document(doc)?;
                    added += 1;
                },
                None => {
                    trace!(
                        "[ WRITER @ {} ] entity {} has no indexable content",
                        &self.index_name,
                        entity.id()
                    );
                },
            }
        }

        self.flush_required.store(true, Ordering::Release);
        if let Some(sequence) = sequence {
            self.log.mark_processed(kind, &ids, sequence);
        }

        debug!(
            "[ WRITER @ {} ] wrote {} documents for {} entities (update={})",
            &self.index_name,
            added,
            ids.len(),
            is_update
        );

        Ok(added)
    }

    /// Deletes the documents of the given entities.
    pub(crate) fn remove_from_index(&self, ids: &[EntityId], track_in_log: bool) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let sequence = if track_in_log {
            Some(self.log.record(&[], &[], ids)?)
        } else {
            None
        };

        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(SearchError::ShutDown)?;

        for id in ids {
            writer.delete_term(Term::from_field_u64(self.id_field, *id));
        }

        self.flush_required.store(true, Ordering::Release);
        if let Some(sequence) = sequence {
            self.log.mark_processed(EventKind::Remove, ids, sequence);
        }

        debug!(
            "[ WRITER @ {} ] removed {} documents",
            &self.index_name,
            ids.len()
        );

        Ok(())
    }

    /// Commits pending changes if there are any.
    ///
    /// Returns false when there was nothing to commit. A caller which
    /// raced with another flush returns true once that flush completed.
    pub(crate) fn flush_if_necessary(&self) -> Result<bool> {
        if !self.flush_required.load(Ordering::Acquire) {
            return Ok(false);
        }

        let mut guard = self.writer.lock();
        if !self.flush_required.swap(false, Ordering::AcqRel) {
            return Ok(true);
        }

        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => {
                self.flush_required.store(true, Ordering::Release);
                return Err(SearchError::ShutDown.into());
            },
        };

        let opstamp = match writer.commit() {
            Ok(opstamp) => opstamp,
            Err(e) => {
                self.flush_required.store(true, Ordering::Release);
                return Err(e.into());
            },
        };

        self.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = self.log.drop_processed()?;

        info!(
            "[ WRITER @ {} ][ TRANSACTION {} ] flushed index, {} log entries completed",
            &self.index_name, opstamp, dropped
        );

        Ok(true)
    }

    /// Removes every document from the index and resets the log.
    ///
    /// Indexing tasks queued before this point are skipped.
    pub(crate) fn clear_index(&self) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(SearchError::ShutDown)?;

        writer.delete_all_documents()?;
        let opstamp = writer.commit()?;

        self.flush_required.store(false, Ordering::Release);
        self.wipe_epoch.fetch_add(1, Ordering::AcqRel);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.log.clear()?;

        info!(
            "[ WRITER @ {} ][ TRANSACTION {} ] cleared index",
            &self.index_name, opstamp
        );

        Ok(())
    }

    /// Releases the tantivy writer.
    ///
    /// A clean shutdown commits any pending changes and persists the log,
    /// an emergency shutdown does neither and leaves recovery to the log.
    pub(crate) fn shutdown(&self, emergency: bool) -> Result<()> {
        let mut writer = match self.writer.lock().take() {
            Some(writer) => writer,
            None => return Ok(()),
        };

        if emergency {
            warn!(
                "[ WRITER @ {} ] emergency shutdown, discarding uncommitted changes",
                &self.index_name
            );
            if let Err(e) = writer.wait_merging_threads() {
                warn!(
                    "[ WRITER @ {} ] failed to stop writer threads: {:?}",
                    &self.index_name, e
                );
            }
            return Ok(());
        }

        if self.flush_required.swap(false, Ordering::AcqRel) {
            writer.commit()?;
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.log.drop_processed()?;
        }

        self.log.compact();
        self.log.persist()?;
        writer.wait_merging_threads()?;

        info!("[ WRITER @ {} ] shutdown complete!", &self.index_name);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tantivy::ReloadPolicy;

    use super::*;
    use crate::helpers::init_state;
    use crate::structures::{declaration_from_json, FieldValue};

    fn setup() -> Result<(IndexContext, Writer)> {
        init_state();

        let ctx = declaration_from_json(serde_json::json!({
            "name": "test-writer",
            "storage_type": "memory",
            "writer_buffer": 15_000_000,
            "writer_threads": 1,
            "fields": {
                "title": { "type": "text", "stored": true },
            },
        }))
        .create_context()?;

        let log = Arc::new(OutstandingWorkLog::load(ctx.storage.clone())?);
        let writer = Writer::create(&ctx, log)?;

        Ok((ctx, writer))
    }

    fn entity(id: EntityId, title: &str) -> IndexableEntity {
        IndexableEntity::new(id).with_field("title", FieldValue::Text(title.to_string()))
    }

    fn num_docs(ctx: &IndexContext) -> Result<u64> {
        let reader = ctx
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        reader.reload()?;
        Ok(reader.searcher().num_docs())
    }

    #[test]
    fn most_recent_duplicate_wins() -> Result<()> {
        let (ctx, writer) = setup()?;

        let added = writer.index(
            &[entity(1, "old"), entity(2, "other"), entity(1, "new")],
            false,
            true,
        )?;
        assert_eq!(added, 2);

        assert!(writer.flush_if_necessary()?);
        assert_eq!(num_docs(&ctx)?, 2);
        assert!(writer.log().is_empty());

        Ok(())
    }

    #[test]
    fn repeated_updates_leave_one_document() -> Result<()> {
        let (ctx, writer) = setup()?;

        writer.index(&[entity(1, "first")], true, true)?;
        writer.index(&[entity(1, "second")], true, true)?;
        writer.flush_if_necessary()?;
        writer.index(&[entity(1, "third")], true, false)?;
        writer.flush_if_necessary()?;

        assert_eq!(num_docs(&ctx)?, 1);

        Ok(())
    }

    #[test]
    fn hidden_update_only_deletes() -> Result<()> {
        let (ctx, writer) = setup()?;

        writer.index(&[entity(1, "visible")], false, false)?;
        writer.flush_if_necessary()?;
        assert_eq!(num_docs(&ctx)?, 1);

        let added = writer.index(&[entity(1, "visible").hidden()], true, false)?;
        assert_eq!(added, 0);
        writer.flush_if_necessary()?;
        assert_eq!(num_docs(&ctx)?, 0);

        Ok(())
    }

    #[test]
    fn log_entries_are_kept_until_flush() -> Result<()> {
        let (_ctx, writer) = setup()?;

        writer.index(&[entity(1, "a"), entity(2, "b")], false, true)?;
        writer.remove_from_index(&[3], true)?;

        let snapshot = writer.log().snapshot();
        assert_eq!(snapshot.persisted(), &[1, 2]);
        assert_eq!(snapshot.removed(), &[3]);

        writer.flush_if_necessary()?;
        assert!(writer.log().is_empty());

        Ok(())
    }

    #[test]
    fn flush_without_changes_does_nothing() -> Result<()> {
        let (_ctx, writer) = setup()?;

        assert!(!writer.flush_if_necessary()?);
        assert_eq!(writer.generation(), 0);

        writer.remove_from_index(&[1], false)?;
        assert!(writer.flush_if_necessary()?);
        assert!(!writer.flush_if_necessary()?);
        assert_eq!(writer.generation(), 1);

        Ok(())
    }

    #[test]
    fn concurrent_flushes_commit_once() -> Result<()> {
        let (_ctx, writer) = setup()?;
        let writer = Arc::new(writer);

        writer.index(&[entity(1, "a")], false, true)?;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let writer = writer.clone();
                std::thread::spawn(move || writer.flush_if_necessary())
            })
            .collect();

        let mut flushed = vec![];
        for handle in handles {
            flushed.push(handle.join().expect("join flush thread")?);
        }

        assert!(flushed.iter().any(|v| *v));
        assert_eq!(writer.generation(), 1);

        Ok(())
    }

    #[test]
    fn commit_recorded_during_a_write_survives_the_flush() -> Result<()> {
        let (_ctx, writer) = setup()?;
        let writer = Arc::new(writer);

        // Park the indexing thread between its log record and the write.
        let guard = writer.writer.lock();
        let handle = {
            let writer = writer.clone();
            std::thread::spawn(move || writer.index(&[entity(1, "first")], true, true))
        };

        while writer.log().snapshot().updated().is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }

        // A second commit touching the same entity lands in that window.
        writer.log().record(&[], &[1], &[])?;
        drop(guard);

        handle.join().expect("join indexing thread")?;
        writer.flush_if_necessary()?;

        assert_eq!(writer.log().snapshot().updated(), &[1]);

        Ok(())
    }

    #[test]
    fn clear_resets_index_and_log() -> Result<()> {
        let (ctx, writer) = setup()?;

        writer.index(&[entity(1, "a"), entity(2, "b")], false, false)?;
        writer.flush_if_necessary()?;
        writer.remove_from_index(&[9], true)?;

        writer.clear_index()?;
        assert_eq!(num_docs(&ctx)?, 0);
        assert!(writer.log().is_empty());
        assert_eq!(writer.wipe_epoch(), 1);

        Ok(())
    }

    #[test]
    fn emergency_shutdown_keeps_log() -> Result<()> {
        let (ctx, writer) = setup()?;

        writer.index(&[entity(1, "a")], false, true)?;
        writer.shutdown(true)?;

        assert!(!writer.is_open());
        assert_eq!(writer.log().snapshot().persisted(), &[1]);
        assert_eq!(num_docs(&ctx)?, 0);
        assert!(writer.index(&[entity(2, "b")], false, false).is_err());

        Ok(())
    }

    #[test]
    fn clean_shutdown_commits() -> Result<()> {
        let (ctx, writer) = setup()?;

        writer.index(&[entity(1, "a")], false, true)?;
        writer.shutdown(false)?;

        assert!(writer.log().is_empty());
        assert_eq!(num_docs(&ctx)?, 1);

        Ok(())
    }
}
