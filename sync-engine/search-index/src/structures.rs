use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use serde::{Deserialize, Serialize};
use tantivy::directory::MmapDirectory;
use tantivy::{Index, IndexSettings, Score};
use time::OffsetDateTime;

use crate::helpers::{cr32_hash, Validate};
use crate::reader::ReaderContext;
use crate::schema::{FieldKind, IndexFields, SchemaContext};
use crate::storage::{Marker, StorageBackend};
use crate::tokenizer::{SimpleUnicodeTokenizer, UNICODE_TOKENIZER};
use crate::writer::WriterContext;

pub static ROOT_PATH: &str = "./index";
pub static INDEX_STORAGE_SUB_PATH: &str = "index-storage";
pub static INDEX_DATA_SUB_PATH: &str = "data";
pub static INDEX_METADATA_SUB_PATH: &str = "metadata";

/// The stable identity of an entity in the primary store.
pub type EntityId = u64;

/// A typed value of an entity field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Keyword(String),
    Date(OffsetDateTime),
    Number(i64),
    Boolean(bool),
}

impl FieldValue {
    #[inline]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Text(_) => FieldKind::Text,
            Self::Keyword(_) => FieldKind::Keyword,
            Self::Date(_) => FieldKind::Date,
            Self::Number(_) => FieldKind::Number,
            Self::Boolean(_) => FieldKind::Boolean,
        }
    }
}

/// A record of the primary store which can be projected into a document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexableEntity {
    id: EntityId,

    /// Hidden entities are soft-deleted and never indexed.
    visible: bool,

    fields: Vec<(String, FieldValue)>,
}

impl IndexableEntity {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            visible: true,
            fields: vec![],
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    #[inline]
    pub fn id(&self) -> EntityId {
        self.id
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    #[inline]
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }
}

/// A single search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// The id of the entity backing the document.
    pub entity_id: EntityId,

    /// The relevancy score of the hit.
    pub score: Score,

    /// The stored field values of the document.
    pub fields: BTreeMap<String, Vec<String>>,
}

/// The possible index storage backends.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Store the index and its metadata fully in memory.
    Memory,

    /// Store the index and its metadata on disk.
    FileSystem,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct SyncContext {
    /// The number of entities indexed per chunk during a full reindex.
    #[serde(default = "defaults::default_chunk_size")]
    pub(crate) chunk_size: usize,

    /// The number of reindex chunks between each flush.
    #[serde(default = "defaults::default_flush_every_chunks")]
    pub(crate) flush_every_chunks: usize,

    /// The number of entities an indexing task writes between
    /// cancellation checks.
    #[serde(default = "defaults::default_task_batch_size")]
    pub(crate) task_batch_size: usize,

    /// Runs indexing tasks on the submitting thread instead of the
    /// background worker.
    #[serde(default)]
    pub(crate) synchronous: bool,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self {
            chunk_size: defaults::default_chunk_size(),
            flush_every_chunks: defaults::default_flush_every_chunks(),
            task_batch_size: defaults::default_task_batch_size(),
            synchronous: false,
        }
    }
}

impl Validate for SyncContext {
    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::msg("chunk size must be at least 1."));
        }

        if self.flush_every_chunks == 0 {
            return Err(Error::msg("flush every chunks must be at least 1."));
        }

        if self.task_batch_size == 0 {
            return Err(Error::msg("task batch size must be at least 1."));
        }

        Ok(())
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn default_base_path() -> PathBuf {
        PathBuf::from(super::ROOT_PATH)
    }

    pub fn default_chunk_size() -> usize {
        500
    }

    pub fn default_flush_every_chunks() -> usize {
        10
    }

    pub fn default_task_batch_size() -> usize {
        100
    }
}

/// A given index declaration that describes the behaviour of a new index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDeclaration {
    /// The name of the index.
    pub(crate) name: String,

    /// The storage type used to store index data.
    pub(crate) storage_type: StorageType,

    /// The directory file system indexes are kept in.
    #[serde(default = "defaults::default_base_path")]
    pub(crate) base_path: PathBuf,

    #[serde(flatten)]
    schema_ctx: SchemaContext,

    #[serde(flatten)]
    reader_ctx: ReaderContext,

    #[serde(flatten)]
    writer_ctx: WriterContext,

    #[serde(flatten)]
    sync_ctx: SyncContext,
}

impl Validate for IndexDeclaration {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::msg("index name must not be empty."));
        }

        self.writer_ctx.validate()?;
        self.reader_ctx.validate()?;
        self.schema_ctx.validate()?;
        self.sync_ctx.validate()?;

        Ok(())
    }
}

/// Opens the file system index at the given path.
///
/// An index which cannot be opened or no longer matches the declared
/// schema is treated as corrupted, it is removed and recreated empty.
/// Returns whether the index had to be created.
fn open_or_recreate(path: &Path, schema_ctx: &SchemaContext) -> Result<(Index, bool)> {
    fs::create_dir_all(path)?;

    let dir = MmapDirectory::open(path)
        .with_context(|| format!("failed to open index directory {:?}", path))?;

    let exists = Index::exists(&dir)
        .with_context(|| format!("failed to check for existing index {:?}", path))?;

    if !exists {
        let index = Index::create(dir, schema_ctx.as_tantivy_schema(), IndexSettings::default())?;
        return Ok((index, true));
    }

    let opened = Index::open(dir)
        .map_err(Error::from)
        .and_then(|index| schema_ctx.validate_with_schema(&index.schema()).map(|_| index));

    match opened {
        Ok(index) => Ok((index, false)),
        Err(e) => {
            warn!(
                "existing index at {:?} is unusable and will be recreated: {:?}",
                path, e
            );

            fs::remove_dir_all(path)
                .with_context(|| format!("failed to remove corrupted index {:?}", path))?;
            fs::create_dir_all(path)?;

            let dir = MmapDirectory::open(path)?;
            let index =
                Index::create(dir, schema_ctx.as_tantivy_schema(), IndexSettings::default())?;

            Ok((index, true))
        },
    }
}

impl IndexDeclaration {
    #[inline]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    #[inline]
    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    /// The directory holding the index data and metadata of a file system index.
    pub fn index_path(&self) -> PathBuf {
        self.base_path
            .join(INDEX_STORAGE_SUB_PATH)
            .join(cr32_hash(&self.name).to_string())
    }

    /// Builds IndexContext from the declaration, applying any validation in
    /// the process.
    ///
    /// A newly created index has the reindex marker set, so its first
    /// startup populates it from the primary store.
    #[instrument(name = "index-setup", skip(self), fields(index = %self.name))]
    pub fn create_context(&self) -> Result<IndexContext> {
        self.validate()?;

        let (index, storage, created) = match self.storage_type {
            StorageType::Memory => {
                let index = Index::create_in_ram(self.schema_ctx.as_tantivy_schema());
                (index, StorageBackend::connect(None)?, true)
            },
            StorageType::FileSystem => {
                let root = self.index_path();
                let (index, created) =
                    open_or_recreate(&root.join(INDEX_DATA_SUB_PATH), &self.schema_ctx)?;
                let storage = StorageBackend::connect(Some(&root.join(INDEX_METADATA_SUB_PATH)))?;
                (index, storage, created)
            },
        };

        index
            .tokenizers()
            .register(UNICODE_TOKENIZER, SimpleUnicodeTokenizer);

        let fields = self.schema_ctx.resolve(&index.schema())?;

        if created {
            info!("index has been newly created, marking for reindex");
            storage.set_marker(Marker::Reindex)?;
        }

        Ok(IndexContext {
            name: self.name.clone(),
            storage,
            index,
            fields,
            schema_ctx: self.schema_ctx.clone(),
            reader_ctx: self.reader_ctx.clone(),
            writer_ctx: self.writer_ctx,
            sync_ctx: self.sync_ctx,
        })
    }
}

pub struct IndexContext {
    /// The name of the index.
    pub(crate) name: String,

    /// A sled DB instance used for storing engine state.
    pub(crate) storage: StorageBackend,

    /// The tantivy Index.
    pub(crate) index: Index,

    /// The declared fields resolved against the index schema.
    pub(crate) fields: IndexFields,

    /// The declared fields.
    pub(crate) schema_ctx: SchemaContext,

    /// The context for the searchers.
    pub(crate) reader_ctx: ReaderContext,

    /// The context for the writer.
    pub(crate) writer_ctx: WriterContext,

    /// The context for indexing tasks and maintenance.
    pub(crate) sync_ctx: SyncContext,
}

impl IndexContext {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn schema_ctx(&self) -> &SchemaContext {
        &self.schema_ctx
    }

    #[inline]
    pub fn is_synchronous(&self) -> bool {
        self.sync_ctx.synchronous
    }
}

/// Builds a declaration from its JSON form, panicking on invalid input.
#[cfg(test)]
pub(crate) fn declaration_from_json(value: serde_json::Value) -> IndexDeclaration {
    serde_json::from_value(value).expect("valid index declaration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::init_state;

    fn memory_declaration() -> serde_json::Value {
        serde_json::json!({
            "name": "test-structures",
            "storage_type": "memory",
            "fields": {
                "title": { "type": "text", "stored": true },
                "label": { "type": "keyword" },
            },
        })
    }

    #[test]
    fn defaults_are_applied() {
        let declaration = declaration_from_json(memory_declaration());
        assert_eq!(declaration.sync_ctx.chunk_size, 500);
        assert_eq!(declaration.sync_ctx.flush_every_chunks, 10);
        assert!(!declaration.sync_ctx.synchronous);
        assert_eq!(declaration.base_path, PathBuf::from(ROOT_PATH));
    }

    #[test]
    fn invalid_declarations_are_rejected() {
        let mut value = memory_declaration();
        value["chunk_size"] = serde_json::json!(0);
        assert!(declaration_from_json(value).create_context().is_err());

        let mut value = memory_declaration();
        value["name"] = serde_json::json!("  ");
        assert!(declaration_from_json(value).create_context().is_err());
    }

    #[test]
    fn new_memory_index_is_marked_for_reindex() -> Result<()> {
        init_state();

        let ctx = declaration_from_json(memory_declaration()).create_context()?;
        assert!(ctx.storage.has_marker(Marker::Reindex)?);
        assert!(ctx.fields.get("title").is_some());

        Ok(())
    }

    #[test]
    fn corrupted_index_is_recreated() -> Result<()> {
        init_state();

        let dir = tempfile::tempdir()?;
        let mut value = memory_declaration();
        value["storage_type"] = serde_json::json!("filesystem");
        value["base_path"] = serde_json::json!(dir.path());
        let declaration = declaration_from_json(value);

        {
            let ctx = declaration.create_context()?;
            ctx.storage.clear_marker(Marker::Reindex)?;
        }

        {
            let ctx = declaration.create_context()?;
            assert!(!ctx.storage.has_marker(Marker::Reindex)?);
        }

        let meta = declaration
            .index_path()
            .join(INDEX_DATA_SUB_PATH)
            .join("meta.json");
        fs::write(&meta, b"not json at all")?;

        let ctx = declaration.create_context()?;
        assert!(ctx.storage.has_marker(Marker::Reindex)?);
        assert!(ctx.fields.get("label").is_some());

        Ok(())
    }
}
