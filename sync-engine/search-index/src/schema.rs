use std::sync::Arc;

use anyhow::{anyhow, Error, Result};
use hashbrown::HashMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tantivy::schema::{
    Field,
    IndexRecordOption,
    Schema,
    TextFieldIndexing,
    TextOptions,
    FAST,
    INDEXED,
    STORED,
    STRING,
};

use crate::helpers::Validate;
use crate::tokenizer::UNICODE_TOKENIZER;

/// The identity field every document carries, this is the key used
/// for deleting and updating documents.
pub static PRIMARY_KEY: &str = "_id";

/// The kind of value a declared field holds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// Free text, analyzed into words.
    Text,

    /// An exact value such as a label or state, stored lower-cased.
    Keyword,

    /// A timestamp encoded as a sortable string.
    Date,

    /// A signed integer encoded as a sortable string.
    Number,

    /// A `true` / `false` flag.
    Boolean,
}

/// A single field declaration.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct FieldDeclaration {
    #[serde(rename = "type")]
    pub(crate) kind: FieldKind,

    /// Whether the value is stored and returned along with search hits.
    #[serde(default)]
    pub(crate) stored: bool,
}

impl FieldDeclaration {
    fn as_text_options(&self) -> TextOptions {
        let options = match self.kind {
            FieldKind::Text => TextOptions::default().set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(UNICODE_TOKENIZER)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            ),
            _ => STRING,
        };

        if self.stored {
            options.set_stored()
        } else {
            options
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaContext {
    /// The index's fields.
    ///
    /// Entity fields which are not declared here are ignored when mapping
    /// an entity to a document.
    fields: HashMap<String, FieldDeclaration>,

    #[serde(skip)]
    resolved: OnceCell<IndexFields>,
}

impl Validate for SchemaContext {
    fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::msg("at least one field must be declared."));
        }

        if self.fields.contains_key(PRIMARY_KEY) {
            return Err(anyhow!(
                "field name '{}' is reserved for the document identity",
                PRIMARY_KEY,
            ));
        }

        Ok(())
    }

    /// Checks the fields of an existing index against the declared fields.
    ///
    /// These only drift apart when the declaration changes between runs,
    /// in which case the index must be rebuilt.
    fn validate_with_schema(&self, schema: &Schema) -> Result<()> {
        let defined = self.as_tantivy_schema();
        for (_, entry) in defined.fields() {
            let existing = schema
                .get_field(entry.name())
                .map(|field| schema.get_field_entry(field));

            match existing {
                Some(existing) if existing == entry => continue,
                Some(_) => {
                    return Err(anyhow!(
                        "field {:?} has changed since the index was created",
                        entry.name()
                    ))
                },
                None => {
                    return Err(anyhow!(
                        "field {:?} is missing from the existing index",
                        entry.name()
                    ))
                },
            }
        }

        let existing_count = schema.fields().count();
        let defined_count = defined.fields().count();
        if existing_count != defined_count {
            return Err(anyhow!(
                "existing index has {} fields but {} are declared",
                existing_count,
                defined_count,
            ));
        }

        Ok(())
    }
}

impl SchemaContext {
    pub fn new(fields: impl IntoIterator<Item = (String, FieldKind, bool)>) -> Self {
        let fields = fields
            .into_iter()
            .map(|(name, kind, stored)| (name, FieldDeclaration { kind, stored }))
            .collect();

        Self {
            fields,
            resolved: OnceCell::new(),
        }
    }

    pub fn has_field(&self, field_name: &str) -> bool {
        self.fields.contains_key(field_name)
    }

    #[inline]
    pub fn fields(&self) -> &HashMap<String, FieldDeclaration> {
        &self.fields
    }

    /// Builds the tantivy schema from the declared fields.
    ///
    /// Fields are added in name order so the same declaration always
    /// produces the same schema.
    pub fn as_tantivy_schema(&self) -> Schema {
        let mut builder = Schema::builder();
        builder.add_u64_field(PRIMARY_KEY, INDEXED | STORED | FAST);

        let mut names: Vec<&String> = self.fields.keys().collect();
        names.sort();

        for name in names {
            let declaration = &self.fields[name];
            builder.add_text_field(name, declaration.as_text_options());
        }

        builder.build()
    }

    /// Resolves the declared fields against the schema of the opened index.
    pub(crate) fn resolve(&self, schema: &Schema) -> Result<IndexFields> {
        if let Some(resolved) = self.resolved.get() {
            return Ok(resolved.clone());
        }

        let id_field = schema.get_field(PRIMARY_KEY).ok_or_else(|| {
            anyhow!("expected index primary key to exist, the index is corrupted.")
        })?;

        let mut fields = HashMap::with_capacity(self.fields.len());
        for (name, declaration) in self.fields.iter() {
            let field = schema
                .get_field(name)
                .ok_or_else(|| anyhow!("declared field {:?} is missing from the index", name))?;

            fields.insert(name.clone(), (field, declaration.kind));
        }

        let resolved = IndexFields(Arc::new(ResolvedFields { id_field, fields }));
        let _ = self.resolved.set(resolved.clone());

        Ok(resolved)
    }
}

#[derive(Debug)]
struct ResolvedFields {
    id_field: Field,
    fields: HashMap<String, (Field, FieldKind)>,
}

/// The declared fields resolved to their tantivy handles.
#[derive(Debug, Clone)]
pub(crate) struct IndexFields(Arc<ResolvedFields>);

impl IndexFields {
    #[inline]
    pub(crate) fn id_field(&self) -> Field {
        self.0.id_field
    }

    #[inline]
    pub(crate) fn get(&self, name: &str) -> Option<(Field, FieldKind)> {
        self.0.fields.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_schema() -> SchemaContext {
        SchemaContext::new(vec![
            ("title".to_string(), FieldKind::Text, true),
            ("label".to_string(), FieldKind::Keyword, true),
            ("published".to_string(), FieldKind::Date, false),
        ])
    }

    #[test]
    fn schema_is_deterministic() -> Result<()> {
        let ctx = basic_schema();
        let a = ctx.as_tantivy_schema();
        let b = ctx.as_tantivy_schema();

        assert_eq!(serde_json::to_string(&a)?, serde_json::to_string(&b)?);
        assert!(a.get_field(PRIMARY_KEY).is_some());
        assert!(ctx.validate_with_schema(&b).is_ok());

        Ok(())
    }

    #[test]
    fn reserved_field_is_rejected() {
        let ctx = SchemaContext::new(vec![(PRIMARY_KEY.to_string(), FieldKind::Keyword, true)]);
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn changed_declaration_is_detected() {
        let existing = basic_schema().as_tantivy_schema();

        let changed = SchemaContext::new(vec![
            ("title".to_string(), FieldKind::Text, true),
            ("label".to_string(), FieldKind::Keyword, false),
            ("published".to_string(), FieldKind::Date, false),
        ]);
        assert!(changed.validate_with_schema(&existing).is_err());

        let extra = SchemaContext::new(vec![("title".to_string(), FieldKind::Text, true)]);
        assert!(extra.validate_with_schema(&existing).is_err());
    }

    #[test]
    fn resolves_declared_fields() -> Result<()> {
        let ctx = basic_schema();
        let schema = ctx.as_tantivy_schema();
        let fields = ctx.resolve(&schema)?;

        assert_eq!(fields.id_field(), schema.get_field(PRIMARY_KEY).unwrap());
        assert_eq!(fields.get("label").map(|(_, kind)| kind), Some(FieldKind::Keyword));
        assert!(fields.get("unknown").is_none());

        Ok(())
    }
}
