//! Enumerated output fields.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A field the caller may request from an extraction.
///
/// The set is closed: callers pick from these, they cannot invent keys.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Email,
    Phone,
    Company,
    Title,
    Address,
    Website,
    Summary,
}

/// Coarse JSON type a field value must have.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// A single string.
    Text,
    /// An array of strings (possibly empty).
    TextList,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Name,
        Field::Email,
        Field::Phone,
        Field::Company,
        Field::Title,
        Field::Address,
        Field::Website,
        Field::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Email => "email",
            Field::Phone => "phone",
            Field::Company => "company",
            Field::Title => "title",
            Field::Address => "address",
            Field::Website => "website",
            Field::Summary => "summary",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::Email | Field::Phone | Field::Website => FieldKind::TextList,
            _ => FieldKind::Text,
        }
    }

    /// Required fields must come back non-null from the primary extractor.
    /// Optional fields may be null or absent and are filled with a placeholder.
    pub fn is_required(&self) -> bool {
        matches!(self, Field::Name | Field::Email | Field::Phone)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown field: {s}"))
    }
}

/// Non-empty ordered set of requested fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Field>", into = "Vec<Field>")]
pub struct FieldSet(BTreeSet<Field>);

impl FieldSet {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Result<Self, String> {
        let set: BTreeSet<Field> = fields.into_iter().collect();
        if set.is_empty() {
            return Err("field set must not be empty".to_string());
        }
        Ok(Self(set))
    }

    pub fn all() -> Self {
        Self(Field::ALL.into_iter().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = Field> + '_ {
        self.0.iter().copied()
    }

    pub fn contains(&self, field: Field) -> bool {
        self.0.contains(&field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Vec<Field>> for FieldSet {
    type Error = String;

    fn try_from(value: Vec<Field>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FieldSet> for Vec<Field> {
    fn from(value: FieldSet) -> Self {
        value.0.into_iter().collect()
    }
}
