use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::{IndexReader, LeasedItem, ReloadPolicy, Searcher};

use crate::error::{QueryError, SearchError};
use crate::helpers::Validate;
use crate::query::{QueryBuilder, SearchQuery};
use crate::schema::PRIMARY_KEY;
use crate::structures::{IndexContext, SearchHit};
use crate::writer::Writer;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReaderContext {
    /// The number of searchers tantivy keeps pooled per reload.
    #[serde(default = "defaults::default_num_searchers")]
    num_searchers: usize,

    /// The number of clauses a query may expand into.
    #[serde(default = "defaults::default_max_clause_count")]
    max_clause_count: usize,

    /// The clause limit a too broad query is retried with once.
    #[serde(default = "defaults::default_max_clause_ceiling")]
    max_clause_ceiling: usize,

    /// How long disposing every searcher waits on searchers still in use.
    /// In Seconds.
    #[serde(default = "defaults::default_dispose_timeout")]
    dispose_timeout: u64,
}

mod defaults {
    pub fn default_num_searchers() -> usize {
        2
    }

    pub fn default_max_clause_count() -> usize {
        1024
    }

    pub fn default_max_clause_ceiling() -> usize {
        65_536
    }

    pub fn default_dispose_timeout() -> u64 {
        30
    }
}

impl Validate for ReaderContext {
    fn validate(&self) -> Result<()> {
        if self.num_searchers == 0 {
            return Err(Error::msg("num searchers must be at least 1."));
        }

        if self.max_clause_count == 0 {
            return Err(Error::msg("max clause count must be at least 1."));
        }

        if self.max_clause_ceiling < self.max_clause_count {
            return Err(Error::msg(
                "max clause ceiling must not be bellow the max clause count.",
            ));
        }

        Ok(())
    }
}

/// A point-in-time view of the index shared by every lease taken while
/// it is current.
pub struct SearcherHandle {
    id: u64,

    /// The writer generation the searcher was opened at.
    generation: u64,
    searcher: LeasedItem<Searcher>,
    refs: AtomicUsize,
    disposed: AtomicBool,
}

impl SearcherHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// A counted reference to a searcher, released once dropped.
pub struct SearcherLease {
    manager: Arc<SearcherManager>,
    handle: Arc<SearcherHandle>,
}

impl SearcherLease {
    #[inline]
    pub fn handle(&self) -> &Arc<SearcherHandle> {
        &self.handle
    }
}

impl Deref for SearcherLease {
    type Target = Searcher;

    fn deref(&self) -> &Self::Target {
        &self.handle.searcher
    }
}

impl Drop for SearcherLease {
    fn drop(&mut self) {
        self.manager.release(&self.handle);
    }
}

#[derive(Default)]
struct Registry {
    current: Option<Arc<SearcherHandle>>,

    /// Every handle not yet disposed, including the current one.
    handles: Vec<Arc<SearcherHandle>>,
    next_id: u64,
    closed: bool,
}

/// Hands out searchers consistent with the last flush of the writer.
///
/// Searchers are reference counted, a handle superseded by a newer one
/// is disposed as soon as its last lease is released.
pub struct SearcherManager {
    index_name: Arc<String>,
    reader: IndexReader,
    writer: Arc<Writer>,
    query_builder: QueryBuilder,
    id_field: tantivy::schema::Field,

    registry: Mutex<Registry>,
    released: Condvar,
    disposed: AtomicUsize,

    max_clause_count: AtomicUsize,
    max_clause_ceiling: usize,
    dispose_timeout: Duration,
}

impl SearcherManager {
    #[instrument(name = "searcher-manager", skip_all, fields(index = %ctx.name))]
    pub(crate) fn create(ctx: &IndexContext, writer: Arc<Writer>) -> Result<Self> {
        let reader: IndexReader = ctx
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .num_searchers(ctx.reader_ctx.num_searchers)
            .try_into()?;
        info!(
            "index reader created with reload policy=Manual, num_searchers={}",
            ctx.reader_ctx.num_searchers,
        );

        Ok(Self {
            index_name: Arc::new(ctx.name.clone()),
            reader,
            writer,
            query_builder: QueryBuilder::new(ctx.fields.clone()),
            id_field: ctx.fields.id_field(),
            registry: Mutex::new(Registry::default()),
            released: Condvar::new(),
            disposed: AtomicUsize::new(0),
            max_clause_count: AtomicUsize::new(ctx.reader_ctx.max_clause_count),
            max_clause_ceiling: ctx.reader_ctx.max_clause_ceiling,
            dispose_timeout: Duration::from_secs(ctx.reader_ctx.dispose_timeout),
        })
    }

    /// The number of handles disposed so far.
    #[inline]
    pub fn disposed_count(&self) -> usize {
        self.disposed.load(Ordering::Acquire)
    }

    /// The number of handles which have not been disposed yet.
    pub fn live_handles(&self) -> usize {
        self.registry.lock().handles.len()
    }

    #[inline]
    pub fn max_clause_count(&self) -> usize {
        self.max_clause_count.load(Ordering::Acquire)
    }

    /// Leases a searcher which sees every change flushed before this call.
    ///
    /// Pending changes are flushed first, if that produced a new writer
    /// generation the reader is reloaded and the previous handle superseded.
    pub fn acquire(self: &Arc<Self>) -> Result<SearcherLease> {
        self.writer.flush_if_necessary()?;
        let generation = self.writer.generation();

        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(SearchError::ShutDown.into());
        }

        if let Some(current) = registry.current.as_ref() {
            if current.generation >= generation {
                current.refs.fetch_add(1, Ordering::AcqRel);
                return Ok(SearcherLease {
                    manager: self.clone(),
                    handle: current.clone(),
                });
            }
        }

        self.reader.reload()?;

        let id = registry.next_id;
        registry.next_id += 1;

        let handle = Arc::new(SearcherHandle {
            id,
            generation,
            searcher: self.reader.searcher(),
            refs: AtomicUsize::new(1),
            disposed: AtomicBool::new(false),
        });

        debug!(
            "[ SEARCHER @ {} ] opened searcher {} at generation {}",
            &self.index_name, id, generation
        );

        registry.handles.push(handle.clone());
        if let Some(previous) = registry.current.replace(handle.clone()) {
            if previous.refs.load(Ordering::Acquire) == 0 {
                self.dispose(&mut registry, &previous);
            }
        }

        Ok(SearcherLease {
            manager: self.clone(),
            handle,
        })
    }

    /// Releases a reference to the handle.
    ///
    /// The handle is disposed once it is no longer referenced and has been
    /// superseded. Releasing an unreferenced handle is ignored.
    pub(crate) fn release(&self, handle: &Arc<SearcherHandle>) {
        let mut registry = self.registry.lock();

        let refs = handle.refs.load(Ordering::Acquire);
        if refs == 0 {
            warn!(
                "[ SEARCHER @ {} ] searcher {} released more often than acquired",
                &self.index_name, handle.id
            );
            return;
        }

        handle.refs.store(refs - 1, Ordering::Release);
        if refs == 1 {
            let is_current = registry
                .current
                .as_ref()
                .map(|current| Arc::ptr_eq(current, handle))
                .unwrap_or(false);

            if !is_current {
                self.dispose(&mut registry, handle);
            }
        }

        self.released.notify_all();
    }

    fn dispose(&self, registry: &mut Registry, handle: &Arc<SearcherHandle>) {
        if handle.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        registry.handles.retain(|h| !Arc::ptr_eq(h, handle));
        self.disposed.fetch_add(1, Ordering::AcqRel);

        debug!(
            "[ SEARCHER @ {} ] disposed searcher {}",
            &self.index_name, handle.id
        );
    }

    /// Disposes every handle, waiting on handles still in use.
    ///
    /// Fails once the dispose timeout has elapsed with handles still
    /// referenced, those are disposed when their last lease is released.
    pub(crate) fn dispose_all(&self) -> Result<()> {
        let deadline = Instant::now() + self.dispose_timeout;
        let mut registry = self.registry.lock();
        registry.current = None;

        loop {
            let idle: Vec<Arc<SearcherHandle>> = registry
                .handles
                .iter()
                .filter(|handle| handle.refs.load(Ordering::Acquire) == 0)
                .cloned()
                .collect();

            for handle in idle {
                self.dispose(&mut registry, &handle);
            }

            if registry.handles.is_empty() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::msg(format!(
                    "{} searchers are still in use after waiting {:?}",
                    registry.handles.len(),
                    self.dispose_timeout,
                )));
            }

            let wait = (deadline - now).min(Duration::from_millis(100));
            self.released.wait_for(&mut registry, wait);
        }
    }

    /// Rejects any further leases and disposes every handle.
    ///
    /// Without `wait` only unreferenced handles are disposed, the others
    /// go once their last lease is released.
    pub(crate) fn close(&self, wait: bool) -> Result<()> {
        let mut registry = self.registry.lock();
        registry.closed = true;

        if wait {
            drop(registry);
            return self.dispose_all();
        }

        registry.current = None;
        let idle: Vec<Arc<SearcherHandle>> = registry
            .handles
            .iter()
            .filter(|handle| handle.refs.load(Ordering::Acquire) == 0)
            .cloned()
            .collect();

        for handle in idle {
            self.dispose(&mut registry, &handle);
        }

        Ok(())
    }

    /// Executes the query, returning at most `limit` hits.
    ///
    /// A query expanding into too many clauses is retried once with the
    /// limit raised to the configured ceiling, the raised limit sticks.
    #[instrument(name = "document-searcher", skip_all, fields(index = %self.index_name))]
    pub fn search(self: &Arc<Self>, query: &SearchQuery, limit: usize) -> Result<Vec<SearchHit>, SearchError> {
        let searcher = self.acquire()?;

        let max_clauses = self.max_clause_count();
        let built = match self.query_builder.build(&searcher, query, max_clauses) {
            Ok(built) => built,
            Err(QueryError::TooManyClauses { count, limit }) => {
                if limit >= self.max_clause_ceiling {
                    return Err(SearchError::QueryTooBroad {
                        clauses: count,
                        limit,
                    });
                }

                warn!(
                    "[ SEARCHER @ {} ] query expanded into {} clauses, raising limit from {} to {}",
                    &self.index_name, count, limit, self.max_clause_ceiling
                );
                self.max_clause_count
                    .store(self.max_clause_ceiling, Ordering::Release);

                match self
                    .query_builder
                    .build(&searcher, query, self.max_clause_ceiling)
                {
                    Ok(built) => built,
                    Err(QueryError::TooManyClauses { count, limit }) => {
                        return Err(SearchError::QueryTooBroad {
                            clauses: count,
                            limit,
                        })
                    },
                    Err(QueryError::Invalid(msg)) => return Err(SearchError::InvalidQuery(msg)),
                }
            },
            Err(QueryError::Invalid(msg)) => return Err(SearchError::InvalidQuery(msg)),
        };

        if limit == 0 {
            return Ok(vec![]);
        }

        let top_docs = searcher.search(built.as_ref(), &TopDocs::with_limit(limit))?;

        let schema = searcher.schema();
        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc = searcher.doc(address)?;

            let entity_id = doc
                .get_first(self.id_field)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| {
                    Error::msg("document has been missed labeled (missing primary key '_id'), the dataset is invalid")
                })?;

            let mut fields = std::collections::BTreeMap::<String, Vec<String>>::new();
            for value in doc.field_values() {
                let name = schema.get_field_name(value.field());
                if name == PRIMARY_KEY {
                    continue;
                }

                if let Some(text) = value.value().as_text() {
                    fields
                        .entry(name.to_string())
                        .or_default()
                        .push(text.to_string());
                }
            }

            hits.push(SearchHit {
                entity_id,
                score,
                fields,
            });
        }

        Ok(hits)
    }
}
