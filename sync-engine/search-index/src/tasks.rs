use std::sync::Arc;

use anyhow::Result;
use hashbrown::HashSet;
use task_queue::CancellationToken;

use crate::error::SearchError;
use crate::store::EntityStore;
use crate::structures::{EntityId, IndexableEntity};
use crate::writer::Writer;

/// The entities an indexing task works on.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    /// Entities resolved by the caller.
    Entities(Vec<IndexableEntity>),

    /// Entity ids resolved against the primary store when the task runs.
    References(Vec<EntityId>),
}

impl TaskPayload {
    pub fn len(&self) -> usize {
        match self {
            Self::Entities(entities) => entities.len(),
            Self::References(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A unit of index maintenance executed by the task queue.
#[derive(Debug, Clone)]
pub enum IndexingTask {
    Persist(TaskPayload),
    Update(TaskPayload),
    Remove(Vec<EntityId>),
}

impl IndexingTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Persist(_) => "persist",
            Self::Update(_) => "update",
            Self::Remove(_) => "remove",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Persist(payload) | Self::Update(payload) => payload.len(),
            Self::Remove(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// The number of documents written.
    pub indexed: usize,

    /// Referenced ids which no longer exist in the primary store, these
    /// have been removed from the index.
    pub missing: Vec<EntityId>,
}

/// Everything an indexing task needs while running on the queue.
pub(crate) struct TaskContext {
    pub(crate) index_name: Arc<String>,
    pub(crate) writer: Arc<Writer>,
    pub(crate) store: Arc<dyn EntityStore>,
    pub(crate) batch_size: usize,
}

impl TaskContext {
    /// Executes the task if no wipe of the index happened since it was
    /// submitted at `wipe_epoch`.
    pub(crate) fn execute(
        &self,
        task: IndexingTask,
        token: &CancellationToken,
        wipe_epoch: u64,
    ) -> Result<TaskOutcome> {
        let _maintenance = self.writer.maintenance_shared();

        if self.writer.wipe_epoch() != wipe_epoch {
            info!(
                "[ TASKS @ {} ] skipping {} task of {} entities submitted before the index was cleared",
                &self.index_name,
                task.name(),
                task.len()
            );
            return Ok(TaskOutcome::default());
        }

        let mut outcome = TaskOutcome::default();
        match task {
            IndexingTask::Persist(payload) => self.write(payload, false, token, &mut outcome)?,
            IndexingTask::Update(payload) => self.write(payload, true, token, &mut outcome)?,
            IndexingTask::Remove(ids) => {
                for chunk in ids.chunks(self.batch_size) {
                    check_cancelled(token)?;
                    self.writer.remove_from_index(chunk, true)?;
                }
            },
        }

        Ok(outcome)
    }

    fn write(
        &self,
        payload: TaskPayload,
        is_update: bool,
        token: &CancellationToken,
        outcome: &mut TaskOutcome,
    ) -> Result<()> {
        let entities = match payload {
            TaskPayload::Entities(entities) => entities,
            TaskPayload::References(ids) => {
                let mut entities = Vec::with_capacity(ids.len());
                for id in ids {
                    check_cancelled(token)?;
                    match self.store.load_by_id(id)? {
                        Some(entity) => entities.push(entity),
                        None => outcome.missing.push(id),
                    }
                }
                entities
            },
        };

        if !outcome.missing.is_empty() {
            debug!(
                "[ TASKS @ {} ] {} referenced entities no longer exist",
                &self.index_name,
                outcome.missing.len()
            );
            self.writer.remove_from_index(&outcome.missing, true)?;
        }

        for chunk in latest_only(entities).chunks(self.batch_size) {
            check_cancelled(token)?;
            outcome.indexed += self.writer.index(chunk, is_update, true)?;
        }

        Ok(())
    }
}

/// Keeps the last occurrence of every entity, preserving their order.
fn latest_only(entities: Vec<IndexableEntity>) -> Vec<IndexableEntity> {
    let mut seen = HashSet::with_capacity(entities.len());
    let mut latest: Vec<IndexableEntity> = entities
        .into_iter()
        .rev()
        .filter(|entity| seen.insert(entity.id()))
        .collect();
    latest.reverse();
    latest
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(SearchError::Cancelled.into());
    }

    Ok(())
}
