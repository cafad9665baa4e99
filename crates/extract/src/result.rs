use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::field::{Field, FieldKind, FieldSet};

/// A single extracted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    TextList(Vec<String>),
}

impl FieldValue {
    /// Empty value of the right coarse type.
    pub fn placeholder(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Text => FieldValue::Text(String::new()),
            FieldKind::TextList => FieldValue::TextList(Vec::new()),
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::TextList(_) => FieldKind::TextList,
        }
    }
}

/// Result of an extraction.
///
/// Always shape-valid for the field set it was produced for: one value per requested
/// field, each with the field's coarse type. Serializes as a flat JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredResult {
    values: BTreeMap<Field, FieldValue>,
}

impl StructuredResult {
    /// Build a result, filling any requested field the caller did not supply with its
    /// placeholder and dropping anything that was not requested.
    pub fn complete(fields: &FieldSet, mut values: BTreeMap<Field, FieldValue>) -> Self {
        let values = fields
            .iter()
            .map(|f| {
                let v = values
                    .remove(&f)
                    .filter(|v| v.kind() == f.kind())
                    .unwrap_or_else(|| FieldValue::placeholder(f.kind()));
                (f, v)
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.values.keys().copied()
    }

    /// Does this result carry exactly the requested fields with the right types?
    pub fn satisfies(&self, fields: &FieldSet) -> bool {
        self.values.len() == fields.len()
            && fields
                .iter()
                .all(|f| self.values.get(&f).is_some_and(|v| v.kind() == f.kind()))
    }
}

/// Extraction failure. Every variant is retryable from the queue's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("extraction deadline exceeded after {0} ms")]
    Timeout(u64),

    #[error("upstream extractor failed: {0}")]
    Upstream(String),

    #[error("extractor response has invalid shape: {0}")]
    InvalidShape(String),
}

impl ExtractError {
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn invalid_shape(msg: impl Into<String>) -> Self {
        Self::InvalidShape(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_fills_placeholders_and_drops_extras() {
        let fields = FieldSet::new([Field::Name, Field::Email]).unwrap();
        let mut values = BTreeMap::new();
        values.insert(Field::Name, FieldValue::Text("Ada".into()));
        values.insert(Field::Summary, FieldValue::Text("ignored".into()));

        let result = StructuredResult::complete(&fields, values);

        assert!(result.satisfies(&fields));
        assert_eq!(result.get(Field::Email), Some(&FieldValue::TextList(vec![])));
        assert!(result.get(Field::Summary).is_none());
    }

    #[test]
    fn serializes_as_flat_object() {
        let fields = FieldSet::new([Field::Name, Field::Phone]).unwrap();
        let mut values = BTreeMap::new();
        values.insert(Field::Name, FieldValue::Text("Ada".into()));
        values.insert(Field::Phone, FieldValue::TextList(vec!["+1 555 0100".into()]));

        let json = serde_json::to_value(StructuredResult::complete(&fields, values)).unwrap();
        assert_eq!(json, serde_json::json!({"name": "Ada", "phone": ["+1 555 0100"]}));
    }
}
