use serde::{Deserialize, Serialize};

use drainq_core::{JobId, OwnerId};
use drainq_extract::{Field, FieldSet};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub owner: String,
    pub text: String,
    /// Field names such as `"name"` or `"email"`. Defaults to every field.
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub owner: String,
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Also the shape of a continuation request; its `requested_at` is ignored.
#[derive(Debug, Deserialize)]
pub struct DrainRequest {
    pub owner: String,
    #[serde(default)]
    pub chain_depth: u32,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_owner(raw: &str) -> Result<OwnerId, axum::response::Response> {
    OwnerId::parse(raw).map_err(|e| errors::bad_request("invalid_owner", e.to_string()))
}

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|e| errors::bad_request("invalid_job_id", e.to_string()))
}

pub fn parse_fields(raw: Option<&[String]>) -> Result<FieldSet, axum::response::Response> {
    let Some(raw) = raw else {
        return Ok(FieldSet::all());
    };
    let fields = raw
        .iter()
        .map(|name| name.trim().parse::<Field>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| errors::bad_request("invalid_fields", e))?;
    FieldSet::new(fields).map_err(|e| errors::bad_request("invalid_fields", e))
}
