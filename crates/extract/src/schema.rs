//! Structured-output schema for a field set, and validation of responses against it.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue, json};

use crate::field::{FieldKind, FieldSet};
use crate::result::{ExtractError, FieldValue, StructuredResult};

/// JSON schema the remote extractor is asked to conform to.
///
/// Every requested field is listed in `required`; optional fields are nullable so the
/// model can say "not found" without inventing data.
pub fn json_schema(fields: &FieldSet) -> JsonValue {
    let mut properties = Map::new();
    let mut required = Vec::with_capacity(fields.len());

    for field in fields.iter() {
        let base = match field.kind() {
            FieldKind::Text => json!({"type": "string"}),
            FieldKind::TextList => json!({"type": "array", "items": {"type": "string"}}),
        };
        let prop = if field.is_required() {
            base
        } else {
            json!({"anyOf": [base, {"type": "null"}]})
        };
        properties.insert(field.as_str().to_string(), prop);
        required.push(JsonValue::String(field.as_str().to_string()));
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Validate a decoded response against the requested field set.
///
/// - not an object, or a required field missing/null: `InvalidShape`
/// - any present field with the wrong coarse type: `InvalidShape`
/// - optional field missing/null: placeholder
/// - keys that were not requested are ignored
pub fn validate(value: &JsonValue, fields: &FieldSet) -> Result<StructuredResult, ExtractError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ExtractError::invalid_shape("response is not a JSON object"))?;

    let mut values = BTreeMap::new();
    for field in fields.iter() {
        match obj.get(field.as_str()) {
            None | Some(JsonValue::Null) => {
                if field.is_required() {
                    return Err(ExtractError::invalid_shape(format!(
                        "required field `{field}` is missing"
                    )));
                }
            }
            Some(raw) => {
                let parsed = coerce(raw, field.kind()).ok_or_else(|| {
                    ExtractError::invalid_shape(format!("field `{field}` has the wrong type"))
                })?;
                values.insert(field, parsed);
            }
        }
    }

    Ok(StructuredResult::complete(fields, values))
}

fn coerce(raw: &JsonValue, kind: FieldKind) -> Option<FieldValue> {
    match (kind, raw) {
        (FieldKind::Text, JsonValue::String(s)) => Some(FieldValue::Text(s.trim().to_string())),
        (FieldKind::TextList, JsonValue::Array(items)) => items
            .iter()
            .map(|i| i.as_str().map(|s| s.trim().to_string()))
            .collect::<Option<Vec<_>>>()
            .map(FieldValue::TextList),
        _ => None,
    }
}
