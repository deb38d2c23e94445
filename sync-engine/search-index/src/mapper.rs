use tantivy::Document;
use time::{OffsetDateTime, UtcOffset};

use crate::schema::IndexFields;
use crate::structures::{FieldValue, IndexableEntity};

const SIGN_BIT: u64 = 1 << 63;

/// Encodes a timestamp as `yyyyMMddHHmmss` in UTC.
pub fn encode_date(value: OffsetDateTime) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
    )
}

/// Encodes a signed integer so the lexical order of the encoded values
/// matches the numeric order.
pub fn encode_number(value: i64) -> String {
    format!("{:020}", (value as u64) ^ SIGN_BIT)
}

pub fn encode_boolean(value: bool) -> String {
    if value { "true" } else { "false" }.to_string()
}

pub fn encode_keyword(value: &str) -> String {
    value.trim().to_lowercase()
}

/// The indexed form of a value.
///
/// Text is passed through unchanged as the analyzer registered on the
/// index takes care of it.
pub fn encode_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Text(v) => v.clone(),
        FieldValue::Keyword(v) => encode_keyword(v),
        FieldValue::Date(v) => encode_date(*v),
        FieldValue::Number(v) => encode_number(*v),
        FieldValue::Boolean(v) => encode_boolean(*v),
    }
}

/// Projects entities onto documents of a single index.
#[derive(Clone)]
pub(crate) struct DocumentMapper {
    fields: IndexFields,
}

impl DocumentMapper {
    pub(crate) fn new(fields: IndexFields) -> Self {
        Self { fields }
    }

    /// Maps the entity to a document.
    ///
    /// Returns `None` when none of the entity's fields produce any
    /// indexable content.
    pub(crate) fn map_to_document(&self, entity: &IndexableEntity) -> Option<Document> {
        let mut doc = Document::default();
        let mut has_content = false;

        for (name, value) in entity.fields() {
            let (field, kind) = match self.fields.get(name) {
                Some(resolved) => resolved,
                None => {
                    trace!("skipping undeclared field {:?} of entity {}", name, entity.id());
                    continue;
                },
            };

            if kind != value.kind() {
                trace!(
                    "skipping field {:?} of entity {}, expected {:?} got {:?}",
                    name,
                    entity.id(),
                    kind,
                    value.kind(),
                );
                continue;
            }

            let encoded = encode_value(value);
            if encoded.trim().is_empty() {
                continue;
            }

            doc.add_text(field, encoded);
            has_content = true;
        }

        if !has_content {
            return None;
        }

        doc.add_u64(self.fields.id_field(), entity.id());
        Some(doc)
    }
}
