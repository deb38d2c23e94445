use search_index::SearchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start engine due to an index error: {0}")]
    StartupError(anyhow::Error),

    #[error("failed to read from the entity store: {0}")]
    StoreError(anyhow::Error),

    #[error("the event dispatcher is no longer running")]
    DispatcherStopped,

    #[error(transparent)]
    SearchError(#[from] SearchError),
}
