use thiserror::Error;

/// Errors raised while building a query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query has {count} clauses which exceeds the limit of {limit}")]
    TooManyClauses { count: usize, limit: usize },

    #[error("Invalid query: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("An error occurred while trying to complete this operation: {0}")]
    Persistence(anyhow::Error),

    #[error("Query is too broad, {clauses} clauses exceed the maximum of {limit}")]
    QueryTooBroad { clauses: usize, limit: usize },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("The index has been shut down")]
    ShutDown,
}

impl From<anyhow::Error> for SearchError {
    fn from(e: anyhow::Error) -> Self {
        match e.downcast::<SearchError>() {
            Ok(e) => e,
            Err(e) => Self::Persistence(e),
        }
    }
}

impl From<tantivy::TantivyError> for SearchError {
    fn from(e: tantivy::TantivyError) -> Self {
        Self::Persistence(e.into())
    }
}
