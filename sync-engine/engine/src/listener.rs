use crossbeam::channel::Sender;
use search_index::{EntityEvent, Index};

use crate::error::EngineError;

/// An operation for the event dispatcher thread.
pub(crate) enum DispatchOp {
    /// The events of a durable commit.
    Events(Vec<EntityEvent>),

    /// Answered once every operation sent before it has been dispatched.
    Barrier(Sender<()>),
    Shutdown,
}

/// The hooks the primary store calls around each of its commits.
///
/// `before_commit` runs synchronously inside the commit, `after_commit`
/// once the commit is durable.
#[derive(Clone)]
pub struct CommitListener {
    index: Index,
    events: Sender<DispatchOp>,
}

impl CommitListener {
    pub(crate) fn new(index: Index, events: Sender<DispatchOp>) -> Self {
        Self { index, events }
    }

    /// Records the index work implied by the events in the outstanding
    /// work log.
    ///
    /// An error must abort the commit.
    pub fn before_commit(&self, events: &[EntityEvent]) -> Result<(), EngineError> {
        self.index.record_commit(events)?;
        Ok(())
    }

    /// Hands the events of a durable commit over to the dispatcher.
    pub fn after_commit(&self, events: Vec<EntityEvent>) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }

        self.events
            .send(DispatchOp::Events(events))
            .map_err(|_| EngineError::DispatcherStopped)
    }
}
