use std::iter::FromIterator;

use anyhow::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::StorageBackend;
use crate::structures::EntityId;

static WORK_LOG_KEYSPACE: &str = "outstanding-work";

/// The kind of index operation an entity id is waiting on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Persist,
    Update,
    Remove,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [Self::Persist, Self::Update, Self::Remove];
}

/// A sorted, de-duplicated sequence of entity ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdSet(Vec<EntityId>);

impl IdSet {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: EntityId) -> bool {
        self.0.binary_search(&id).is_ok()
    }

    #[inline]
    pub fn as_slice(&self) -> &[EntityId] {
        &self.0
    }

    pub fn insert(&mut self, id: EntityId) -> bool {
        match self.0.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, id);
                true
            },
        }
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        match self.0.binary_search(&id) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            },
            Err(_) => false,
        }
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }

    /// Releases any over-allocated capacity.
    pub fn compact(&mut self) {
        self.0.shrink_to_fit()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.0.capacity()
    }
}

impl FromIterator<EntityId> for IdSet {
    fn from_iter<T: IntoIterator<Item = EntityId>>(iter: T) -> Self {
        let mut ids: Vec<EntityId> = iter.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self(ids)
    }
}

/// Entity ids grouped by the kind of index operation they are waiting on.
///
/// The three sets are kept disjoint, the most recently recorded kind of
/// an id wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIdsByEventType {
    persisted: IdSet,
    updated: IdSet,
    removed: IdSet,
}

impl EntityIdsByEventType {
    pub fn new(persisted: &[EntityId], updated: &[EntityId], removed: &[EntityId]) -> Self {
        let mut ids = Self::default();
        ids.add_all(persisted, updated, removed);
        ids
    }

    #[inline]
    pub fn get(&self, kind: EventKind) -> &IdSet {
        match kind {
            EventKind::Persist => &self.persisted,
            EventKind::Update => &self.updated,
            EventKind::Remove => &self.removed,
        }
    }

    #[inline]
    fn get_mut(&mut self, kind: EventKind) -> &mut IdSet {
        match kind {
            EventKind::Persist => &mut self.persisted,
            EventKind::Update => &mut self.updated,
            EventKind::Remove => &mut self.removed,
        }
    }

    #[inline]
    pub fn persisted(&self) -> &[EntityId] {
        self.persisted.as_slice()
    }

    #[inline]
    pub fn updated(&self) -> &[EntityId] {
        self.updated.as_slice()
    }

    #[inline]
    pub fn removed(&self) -> &[EntityId] {
        self.removed.as_slice()
    }

    pub fn len(&self) -> usize {
        self.persisted.len() + self.updated.len() + self.removed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds the id under the given kind, removing it from the others.
    pub fn add(&mut self, kind: EventKind, id: EntityId) {
        for other in EventKind::ALL {
            if other != kind {
                self.get_mut(other).remove(id);
            }
        }

        self.get_mut(kind).insert(id);
    }

    pub fn add_all(&mut self, persisted: &[EntityId], updated: &[EntityId], removed: &[EntityId]) {
        for (kind, ids) in [
            (EventKind::Persist, persisted),
            (EventKind::Update, updated),
            (EventKind::Remove, removed),
        ] {
            for id in ids {
                self.add(kind, *id);
            }
        }
    }

    /// Removes every id of `other` from the set of the same kind.
    pub fn remove_all(&mut self, other: &EntityIdsByEventType) {
        for kind in EventKind::ALL {
            for id in other.get(kind).as_slice() {
                self.get_mut(kind).remove(*id);
            }
        }
    }

    /// Removes the id from all three sets.
    fn forget(&mut self, id: EntityId) {
        for kind in EventKind::ALL {
            self.get_mut(kind).remove(id);
        }
    }

    pub fn clear(&mut self) {
        for kind in EventKind::ALL {
            self.get_mut(kind).clear();
        }
    }

    pub fn compact(&mut self) {
        for kind in EventKind::ALL {
            self.get_mut(kind).compact();
        }
    }
}

#[derive(Default)]
struct LogState {
    /// Work not yet confirmed as flushed, this is what gets persisted.
    pending: EntityIdsByEventType,

    /// Work written to the index since the last flush.
    processed: EntityIdsByEventType,

    /// The sequence of the latest record of every pending id.
    sequences: HashMap<EntityId, u64>,
    next_sequence: u64,
}

impl LogState {
    fn forget_sequences(&mut self, ids: &EntityIdsByEventType) {
        for kind in EventKind::ALL {
            for id in ids.get(kind).as_slice() {
                let still_pending = EventKind::ALL
                    .iter()
                    .any(|other| self.pending.get(*other).contains(*id));

                if !still_pending {
                    self.sequences.remove(id);
                }
            }
        }
    }
}

/// The durable record of index operations which have not been confirmed
/// as flushed.
///
/// Every change is persisted before the call returns. If persisting fails
/// the in-memory state is left untouched and the error is returned, so
/// the log never claims more than what is on disk.
pub struct OutstandingWorkLog {
    storage: StorageBackend,
    state: Mutex<LogState>,
}

impl OutstandingWorkLog {
    /// Loads the log from the given storage, starting empty if nothing
    /// was persisted yet.
    pub fn load(storage: StorageBackend) -> Result<Self> {
        let pending: EntityIdsByEventType = storage
            .load_structure(WORK_LOG_KEYSPACE)?
            .unwrap_or_default();

        if !pending.is_empty() {
            info!(
                "loaded outstanding work log persisted={} updated={} removed={}",
                pending.persisted.len(),
                pending.updated.len(),
                pending.removed.len(),
            );
        }

        Ok(Self {
            storage,
            state: Mutex::new(LogState {
                pending,
                ..LogState::default()
            }),
        })
    }

    /// Unions the given ids into the log, returning the sequence stamped
    /// on them.
    ///
    /// Recording an id discards any processed mark it had, the index write
    /// that produced the mark may predate the change being recorded. Marks
    /// made later under an older sequence are ignored for the same reason.
    pub fn record(
        &self,
        persisted: &[EntityId],
        updated: &[EntityId],
        removed: &[EntityId],
    ) -> Result<u64> {
        let mut state = self.state.lock();

        let mut next = state.pending.clone();
        next.add_all(persisted, updated, removed);
        self.replace_pending(&mut state, next)?;

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        for id in persisted.iter().chain(updated).chain(removed) {
            state.processed.forget(*id);
            state.sequences.insert(*id, sequence);
        }

        Ok(sequence)
    }

    /// Removes the given ids from the log.
    pub fn drop(
        &self,
        persisted: &[EntityId],
        updated: &[EntityId],
        removed: &[EntityId],
    ) -> Result<()> {
        let mut state = self.state.lock();

        let dropped = EntityIdsByEventType::new(persisted, updated, removed);
        let mut next = state.pending.clone();
        next.remove_all(&dropped);
        self.replace_pending(&mut state, next)?;
        state.forget_sequences(&dropped);

        Ok(())
    }

    /// An immutable copy of the outstanding work.
    pub fn snapshot(&self) -> EntityIdsByEventType {
        self.state.lock().pending.clone()
    }

    /// Releases over-allocated storage, the contents are unchanged.
    pub fn compact(&self) {
        let mut state = self.state.lock();
        state.pending.compact();
        state.processed.compact();
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Marks the ids as written to the index under the given kind.
    ///
    /// `sequence` is the one returned by the `record` call made before the
    /// write. Ids recorded again since then keep their entry unmarked.
    /// Marks are only kept in memory, they turn into a removal from the log
    /// once the writes are flushed.
    pub fn mark_processed(&self, kind: EventKind, ids: &[EntityId], sequence: u64) {
        let mut state = self.state.lock();
        for id in ids {
            if state.sequences.get(id) != Some(&sequence) {
                trace!("id {} was recorded again while being written, keeping it", id);
                continue;
            }

            state.processed.get_mut(kind).insert(*id);
        }
    }

    /// Removes every processed id from the log.
    ///
    /// Must only be called once the writes behind the marks are durable.
    pub fn drop_processed(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if state.processed.is_empty() {
            return Ok(0);
        }

        let before = state.pending.len();
        let mut next = state.pending.clone();
        next.remove_all(&state.processed);
        let dropped = before - next.len();

        self.replace_pending(&mut state, next)?;
        let processed = std::mem::take(&mut state.processed);
        state.forget_sequences(&processed);

        Ok(dropped)
    }

    /// Resets the log to empty.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.replace_pending(&mut state, EntityIdsByEventType::default())?;
        state.processed.clear();
        state.sequences.clear();
        Ok(())
    }

    /// Writes the current state of the log to storage.
    pub fn persist(&self) -> Result<()> {
        let state = self.state.lock();
        self.storage.store_structure(WORK_LOG_KEYSPACE, &state.pending)
    }

    fn replace_pending(&self, state: &mut LogState, next: EntityIdsByEventType) -> Result<()> {
        if next == state.pending {
            return Ok(());
        }

        self.storage.store_structure(WORK_LOG_KEYSPACE, &next)?;
        state.pending = next;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_log() -> Result<OutstandingWorkLog> {
        OutstandingWorkLog::load(StorageBackend::connect(None)?)
    }

    #[test]
    fn record_is_idempotent_and_disjoint() -> Result<()> {
        let log = new_log()?;
        log.record(&[1, 2], &[3], &[])?;
        log.record(&[1, 2], &[3], &[])?;
        log.record(&[], &[2], &[1])?;

        let snapshot = log.snapshot();
        assert!(snapshot.persisted().is_empty());
        assert_eq!(snapshot.updated(), &[2, 3]);
        assert_eq!(snapshot.removed(), &[1]);

        Ok(())
    }

    #[test]
    fn drop_is_a_set_difference() -> Result<()> {
        let log = new_log()?;
        log.record(&[1, 2], &[3], &[4])?;
        log.drop(&[1], &[], &[4, 99])?;
        log.drop(&[1], &[], &[4])?;

        let snapshot = log.snapshot();
        assert_eq!(snapshot.persisted(), &[2]);
        assert_eq!(snapshot.updated(), &[3]);
        assert!(snapshot.removed().is_empty());

        Ok(())
    }

    #[test]
    fn snapshot_is_isolated_from_later_changes() -> Result<()> {
        let log = new_log()?;
        log.record(&[1], &[], &[])?;

        let snapshot = log.snapshot();
        log.record(&[2], &[], &[])?;

        assert_eq!(snapshot.persisted(), &[1]);
        assert_eq!(log.snapshot().persisted(), &[1, 2]);

        Ok(())
    }

    #[test]
    fn processed_marks_are_dropped_together() -> Result<()> {
        let log = new_log()?;
        let persisted = log.record(&[1, 2], &[], &[])?;
        let removed = log.record(&[], &[], &[3])?;
        log.mark_processed(EventKind::Persist, &[1, 2], persisted);
        log.mark_processed(EventKind::Remove, &[3], removed);

        assert_eq!(log.drop_processed()?, 3);
        assert!(log.is_empty());
        assert_eq!(log.drop_processed()?, 0);

        Ok(())
    }

    #[test]
    fn recording_again_invalidates_processed_mark() -> Result<()> {
        let log = new_log()?;
        let sequence = log.record(&[], &[1], &[])?;
        log.mark_processed(EventKind::Update, &[1], sequence);

        // A newer change arrives before the flush.
        log.record(&[], &[1], &[])?;

        assert_eq!(log.drop_processed()?, 0);
        assert_eq!(log.snapshot().updated(), &[1]);

        Ok(())
    }

    #[test]
    fn marks_from_an_older_record_are_ignored() -> Result<()> {
        let log = new_log()?;
        let first = log.record(&[], &[1, 2], &[])?;

        // Recorded again while the first write is still in flight.
        let second = log.record(&[], &[1], &[])?;
        assert!(second > first);

        log.mark_processed(EventKind::Update, &[1, 2], first);
        assert_eq!(log.drop_processed()?, 1);
        assert_eq!(log.snapshot().updated(), &[1]);

        log.mark_processed(EventKind::Update, &[1], second);
        assert_eq!(log.drop_processed()?, 1);
        assert!(log.is_empty());
        assert!(log.state.lock().sequences.is_empty());

        Ok(())
    }

    #[test]
    fn compact_keeps_contents() -> Result<()> {
        let log = new_log()?;
        let ids: Vec<EntityId> = (0..1_000).collect();
        log.record(&ids, &[], &[])?;
        log.drop(&ids[10..], &[], &[])?;

        let before = log.snapshot();
        log.compact();
        let after = log.snapshot();

        assert_eq!(before, after);
        assert!(log.state.lock().pending.persisted.capacity() <= 10 + 1);

        Ok(())
    }

    #[test]
    fn persisted_log_survives_reopening() -> Result<()> {
        let dir = tempfile::tempdir()?;

        {
            let log = OutstandingWorkLog::load(StorageBackend::connect(Some(dir.path()))?)?;
            log.record(&[5, 6], &[], &[7])?;
        }

        let log = OutstandingWorkLog::load(StorageBackend::connect(Some(dir.path()))?)?;
        let snapshot = log.snapshot();
        assert_eq!(snapshot.persisted(), &[5, 6]);
        assert_eq!(snapshot.removed(), &[7]);

        log.clear()?;
        assert!(log.is_empty());

        Ok(())
    }
}
