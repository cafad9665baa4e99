//! Deterministic, local, pattern-based extractor.
//!
//! Used when the remote extractor is degraded. It never fails: fields it cannot find
//! come back as placeholders, so the output always satisfies the requested shape.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::extractor::Extractor;
use crate::field::{Field, FieldSet};
use crate::result::{ExtractError, FieldValue, StructuredResult};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").expect("email regex")
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\+?\d{1,3}[\s.-]?)?(?:\(\d{2,4}\)[\s.-]?)?\d{2,4}[\s.-]?\d{3,4}[\s.-]?\d{3,4}")
        .expect("phone regex")
});

static WEBSITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:https?://|www\.)[a-z0-9.-]+\.[a-z]{2,}(?:/[^\s]*)?").expect("url regex")
});

static COMPANY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:inc|llc|ltd|gmbh|corp|corporation|company|co\.|s\.a\.|plc)\b")
        .expect("company regex")
});

static TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:ceo|cto|cfo|coo|founder|co-founder|president|director|manager|engineer|developer|consultant|analyst|designer|head of|vp|vice president|lead)\b",
    )
    .expect("title regex")
});

static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d{1,6}\s+[a-z0-9 .'-]+\b(?:street|st\.?|avenue|ave\.?|road|rd\.?|boulevard|blvd\.?|lane|ln\.?|drive|dr\.?|way|suite)\b",
    )
    .expect("address regex")
});

const SUMMARY_CHARS: usize = 280;

#[derive(Debug, Default, Copy, Clone)]
pub struct HeuristicExtractor;

impl HeuristicExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous extraction (no IO, bounded by input size).
    pub fn extract_sync(&self, text: &str, fields: &FieldSet) -> StructuredResult {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        let mut values = BTreeMap::new();
        for field in fields.iter() {
            let value = match field {
                Field::Email => FieldValue::TextList(all_matches(&EMAIL, text)),
                Field::Phone => FieldValue::TextList(phones(text)),
                Field::Website => FieldValue::TextList(all_matches(&WEBSITE, text)),
                Field::Company => FieldValue::Text(first_line_matching(&lines, &COMPANY)),
                Field::Title => FieldValue::Text(first_line_matching(&lines, &TITLE)),
                Field::Address => FieldValue::Text(
                    ADDRESS
                        .find(text)
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_default(),
                ),
                Field::Name => FieldValue::Text(guess_name(&lines)),
                Field::Summary => FieldValue::Text(summary(text)),
            };
            values.insert(field, value);
        }

        StructuredResult::complete(fields, values)
    }
}

#[async_trait::async_trait]
impl Extractor for HeuristicExtractor {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn extract(&self, text: &str, fields: &FieldSet) -> Result<StructuredResult, ExtractError> {
        Ok(self.extract_sync(text, fields))
    }
}

fn all_matches(re: &Regex, text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in re.find_iter(text) {
        let s = m.as_str().trim_end_matches(['.', ',', ';']).to_string();
        if !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

fn phones(text: &str) -> Vec<String> {
    // Digit runs shorter than 7 are dates, zip codes and the like.
    all_matches(&PHONE, text)
        .into_iter()
        .filter(|p| p.chars().filter(char::is_ascii_digit).count() >= 7)
        .collect()
}

fn first_line_matching(lines: &[&str], re: &Regex) -> String {
    lines
        .iter()
        .find(|l| re.is_match(l))
        .map(|l| l.to_string())
        .unwrap_or_default()
}

/// First short line made of capitalised words with no digits or `@`.
fn guess_name(lines: &[&str]) -> String {
    lines
        .iter()
        .find(|l| {
            let words: Vec<&str> = l.split_whitespace().collect();
            (2..=4).contains(&words.len())
                && !l.contains('@')
                && !l.chars().any(|c| c.is_ascii_digit())
                && words
                    .iter()
                    .all(|w| w.chars().next().is_some_and(char::is_uppercase))
        })
        .map(|l| l.to_string())
        .unwrap_or_default()
}

fn summary(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SUMMARY_CHARS).collect()
}
