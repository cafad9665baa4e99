//! `drainq-extract`
//!
//! **Responsibility:** turn free text into a structured record for a requested field set.
//!
//! This crate stays storage-agnostic:
//! - It never touches the job store or job state.
//! - Every call is bounded by a caller-supplied deadline.
//! - Failures are typed (`ExtractError`) so the queue can decide reset, kill or fallback.

pub mod extractor;
pub mod field;
pub mod heuristic;
pub mod llm;
pub mod result;
pub mod schema;

pub use extractor::{
    Extracted, ExtractionPipeline, ExtractionStrategy, Extractor, FallbackPolicy,
    extract_with_deadline,
};
pub use field::{Field, FieldKind, FieldSet};
pub use heuristic::HeuristicExtractor;
pub use llm::{LlmConfig, LlmExtractor};
pub use result::{ExtractError, FieldValue, StructuredResult};
