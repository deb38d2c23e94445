#[macro_use]
extern crate tracing;

mod error;
mod events;
mod helpers;
mod index;
mod mapper;
mod orchestrator;
mod query;
mod reader;
mod schema;
mod storage;
mod store;
pub mod structures;
mod tasks;
mod tokenizer;
mod work_log;
mod writer;

pub use error::{QueryError, SearchError};
pub use events::{classify, ClassifiedEvents, EntityEvent};
pub use helpers::cr32_hash;
pub use index::{Index, StartupReport};
pub use mapper::{encode_boolean, encode_date, encode_keyword, encode_number, encode_value};
pub use orchestrator::{CleanupOutcome, NoopProgress, Progress, ReindexOutcome};
pub use query::{Occur, SearchQuery};
pub use reader::{SearcherHandle, SearcherLease, SearcherManager};
pub use schema::{FieldKind, SchemaContext, PRIMARY_KEY};
pub use storage::{Marker, StorageBackend};
pub use store::{EntityIter, EntityStore, MemoryEntityStore};
pub use structures::{
    EntityId,
    FieldValue,
    IndexContext,
    IndexDeclaration,
    IndexableEntity,
    SearchHit,
    StorageType,
    INDEX_DATA_SUB_PATH,
    INDEX_METADATA_SUB_PATH,
    INDEX_STORAGE_SUB_PATH,
};
pub use task_queue::CancellationToken;
pub use tasks::{IndexingTask, TaskOutcome, TaskPayload};
pub use work_log::{EntityIdsByEventType, EventKind, IdSet, OutstandingWorkLog};
