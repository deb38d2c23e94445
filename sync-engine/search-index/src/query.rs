use std::collections::BTreeSet;
use std::ops::Bound;

use tantivy::query::{AllQuery, BooleanQuery, EmptyQuery, Query, RangeQuery, TermQuery};
use tantivy::schema::{Field, IndexRecordOption};
use tantivy::{Searcher, Term};

use crate::error::QueryError;
use crate::mapper::encode_value;
use crate::schema::{FieldKind, IndexFields};
use crate::structures::{EntityId, FieldValue};
use crate::tokenizer::produce_terms;

/// Defines whether a clause in a query must be present,
/// should be present or must be not present.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Occur {
    /// For a given document to be considered for scoring,
    /// at least one of the document with the Should or the Must
    /// Occur constraint must be within the document.
    ///
    /// This is the default.
    Should,

    /// Document without the clause are excluded from the search.
    Must,

    /// Document that match the clause are excluded from the
    /// search.
    MustNot,
}

impl Default for Occur {
    fn default() -> Self {
        Self::Should
    }
}

impl Occur {
    fn as_tantivy_value(&self) -> tantivy::query::Occur {
        use tantivy::query::Occur;

        match self {
            Self::Should => Occur::Should,
            Self::Must => Occur::Must,
            Self::MustNot => Occur::MustNot,
        }
    }
}

/// A pre-built query expression.
#[derive(Debug, Clone)]
pub enum SearchQuery {
    /// Matches every document.
    All,

    /// Matches the document of a single entity.
    Identity(EntityId),

    /// Matches an exact keyword, date, number or boolean value.
    Term { field: String, value: FieldValue },

    /// Matches documents containing every word of the text.
    Text { field: String, text: String },

    /// Matches terms against a pattern where `*` matches any sequence
    /// of characters and `?` matches a single character.
    Wildcard { field: String, pattern: String },

    /// Matches values between the two inclusive bounds, a missing bound
    /// is unbounded.
    Range {
        field: String,
        lower: Option<FieldValue>,
        upper: Option<FieldValue>,
    },

    Boolean(Vec<(Occur, SearchQuery)>),
}

/// A query along with the number of clauses it expanded into.
pub(crate) struct BuiltQuery {
    pub(crate) query: Box<dyn Query>,
    pub(crate) clauses: usize,
}

/// Turns `SearchQuery` expressions into tantivy queries.
#[derive(Clone)]
pub(crate) struct QueryBuilder {
    fields: IndexFields,
}

impl QueryBuilder {
    pub(crate) fn new(fields: IndexFields) -> Self {
        Self { fields }
    }

    /// Builds the query, failing if it expands into more than
    /// `max_clauses` clauses.
    ///
    /// Wildcards are expanded against the terms of the given searcher.
    pub(crate) fn build(
        &self,
        searcher: &Searcher,
        query: &SearchQuery,
        max_clauses: usize,
    ) -> Result<Box<dyn Query>, QueryError> {
        let built = self.build_inner(searcher, query)?;
        if built.clauses > max_clauses {
            return Err(QueryError::TooManyClauses {
                count: built.clauses,
                limit: max_clauses,
            });
        }

        Ok(built.query)
    }

    fn build_inner(&self, searcher: &Searcher, query: &SearchQuery) -> Result<BuiltQuery, QueryError> {
        let built = match query {
            SearchQuery::All => BuiltQuery {
                query: Box::new(AllQuery),
                clauses: 1,
            },
            SearchQuery::Identity(id) => BuiltQuery {
                query: Box::new(TermQuery::new(
                    Term::from_field_u64(self.fields.id_field(), *id),
                    IndexRecordOption::Basic,
                )),
                clauses: 1,
            },
            SearchQuery::Term { field, value } => {
                let field = self.exact_field(field, value)?;
                BuiltQuery {
                    query: Box::new(TermQuery::new(
                        Term::from_field_text(field, &encode_value(value)),
                        IndexRecordOption::Basic,
                    )),
                    clauses: 1,
                }
            },
            SearchQuery::Text { field, text } => self.text_query(field, text)?,
            SearchQuery::Wildcard { field, pattern } => {
                self.wildcard_query(searcher, field, pattern)?
            },
            SearchQuery::Range {
                field: name,
                lower,
                upper,
            } => {
                let value = lower.as_ref().or_else(|| upper.as_ref()).ok_or_else(|| {
                    QueryError::Invalid(format!("range on {:?} has no bounds", name))
                })?;
                let field = self.exact_field(name, value)?;

                let lower = range_bound(name, value, lower.as_ref())?;
                let upper = range_bound(name, value, upper.as_ref())?;

                BuiltQuery {
                    query: Box::new(RangeQuery::new_str_bounds(
                        field,
                        as_bound(&lower),
                        as_bound(&upper),
                    )),
                    clauses: 1,
                }
            },
            SearchQuery::Boolean(clauses) => {
                if clauses.is_empty() {
                    return Err(QueryError::Invalid(
                        "boolean query must have at least one clause".to_string(),
                    ));
                }

                let mut count = 0;
                let mut parts = Vec::with_capacity(clauses.len());
                for (occur, clause) in clauses {
                    let built = self.build_inner(searcher, clause)?;
                    count += built.clauses;
                    parts.push((occur.as_tantivy_value(), built.query));
                }

                BuiltQuery {
                    query: Box::new(BooleanQuery::new(parts)),
                    clauses: count,
                }
            },
        };

        Ok(built)
    }

    fn get_field(&self, name: &str) -> Result<(Field, FieldKind), QueryError> {
        self.fields
            .get(name)
            .ok_or_else(|| QueryError::Invalid(format!("unknown field {:?}", name)))
    }

    /// Resolves a field holding untokenized values of the given kind.
    fn exact_field(&self, name: &str, value: &FieldValue) -> Result<Field, QueryError> {
        let (field, kind) = self.get_field(name)?;

        if kind == FieldKind::Text {
            return Err(QueryError::Invalid(format!(
                "field {:?} is a text field, use a text query instead",
                name
            )));
        }

        if kind != value.kind() {
            return Err(QueryError::Invalid(format!(
                "field {:?} holds {:?} values but got {:?}",
                name,
                kind,
                value.kind()
            )));
        }

        Ok(field)
    }

    fn text_query(&self, name: &str, text: &str) -> Result<BuiltQuery, QueryError> {
        let (field, kind) = self.get_field(name)?;
        if kind != FieldKind::Text {
            return Err(QueryError::Invalid(format!(
                "field {:?} is not a text field",
                name
            )));
        }

        let terms = produce_terms(text);
        if terms.is_empty() {
            return Err(QueryError::Invalid(format!(
                "text {:?} contains no searchable words",
                text
            )));
        }

        let clauses = terms.len();
        let parts: Vec<(tantivy::query::Occur, Box<dyn Query>)> = terms
            .into_iter()
            .map(|term| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(field, &term),
                    IndexRecordOption::WithFreqs,
                ));
                (tantivy::query::Occur::Must, query)
            })
            .collect();

        Ok(BuiltQuery {
            query: Box::new(BooleanQuery::new(parts)),
            clauses,
        })
    }

    /// Expands the pattern into one clause per matching term.
    fn wildcard_query(
        &self,
        searcher: &Searcher,
        name: &str,
        pattern: &str,
    ) -> Result<BuiltQuery, QueryError> {
        let (field, _) = self.get_field(name)?;
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return Err(QueryError::Invalid("wildcard pattern is empty".to_string()));
        }

        let terms = expand_wildcard(searcher, field, &pattern)
            .map_err(|e| QueryError::Invalid(format!("failed to expand wildcard: {}", e)))?;

        if terms.is_empty() {
            return Ok(BuiltQuery {
                query: Box::new(EmptyQuery),
                clauses: 0,
            });
        }

        let clauses = terms.len();
        let parts: Vec<(tantivy::query::Occur, Box<dyn Query>)> = terms
            .into_iter()
            .map(|term| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(field, &term),
                    IndexRecordOption::Basic,
                ));
                (tantivy::query::Occur::Should, query)
            })
            .collect();

        Ok(BuiltQuery {
            query: Box::new(BooleanQuery::new(parts)),
            clauses,
        })
    }
}

fn range_bound(
    name: &str,
    expected: &FieldValue,
    bound: Option<&FieldValue>,
) -> Result<Option<String>, QueryError> {
    let bound = match bound {
        Some(bound) => bound,
        None => return Ok(None),
    };

    if bound.kind() != expected.kind() {
        return Err(QueryError::Invalid(format!(
            "range bounds on {:?} must be of the same kind",
            name
        )));
    }

    Ok(Some(encode_value(bound)))
}

fn as_bound(value: &Option<String>) -> Bound<&str> {
    match value {
        Some(v) => Bound::Included(v.as_str()),
        None => Bound::Unbounded,
    }
}

/// Collects the distinct terms of the field matching the pattern across
/// every segment.
fn expand_wildcard(searcher: &Searcher, field: Field, pattern: &str) -> tantivy::Result<BTreeSet<String>> {
    let prefix: String = pattern.chars().take_while(|c| *c != '*' && *c != '?').collect();

    let mut matches = BTreeSet::new();
    for segment in searcher.segment_readers() {
        let inverted = segment.inverted_index(field)?;
        let mut stream = inverted
            .terms()
            .range()
            .ge(prefix.as_bytes())
            .into_stream()?;

        while stream.advance() {
            let key = stream.key();
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }

            if let Ok(term) = std::str::from_utf8(key) {
                if wildcard_match(pattern, term) {
                    matches.insert(term.to_string());
                }
            }
        }
    }

    Ok(matches)
}

/// Matches the text against a pattern of literal characters, `*` and `?`.
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            },
            Some(c) if *c == '?' || *c == text[t] => {
                p += 1;
                t += 1;
            },
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                },
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
