//! Webhook payload normalization.
//!
//! Lead forms, call trackers, and booking tools all post slightly different
//! JSON. Known fields are trimmed and typed; everything else is kept verbatim
//! in `custom_fields`.

use serde_json::{Map, Value};

use crate::error::IntakeError;
use crate::leads::model::CustomFields;

/// Source recorded when the payload names none.
pub const DEFAULT_SOURCE: &str = "webhook";

const KNOWN_FIELDS: &[&str] = &[
    "name",
    "email",
    "phone",
    "message",
    "source",
    "idempotency_key",
    "custom_fields",
];

/// A validated, normalized webhook payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLead {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub message: Option<String>,
    pub source: String,
    pub custom_fields: CustomFields,
    /// Caller-supplied dedup hint from the body's `idempotency_key`.
    pub idempotency_hint: Option<String>,
}

impl NormalizedLead {
    /// Parse and normalize a raw request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, IntakeError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| IntakeError::Validation(format!("malformed JSON: {e}")))?;
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(IntakeError::Validation(
                "payload must be a JSON object".into(),
            )),
        }
    }

    pub fn from_map(mut map: Map<String, Value>) -> Result<Self, IntakeError> {
        let name = text_field(&map, "name")?
            .ok_or_else(|| IntakeError::Validation("name is required".into()))?;
        let email = text_field(&map, "email")?.map(|e| e.to_lowercase());
        let phone = text_field(&map, "phone")?;
        let message = text_field(&map, "message")?;
        let source = text_field(&map, "source")?.unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        let idempotency_hint = text_field(&map, "idempotency_key")?;

        let nested = map.remove("custom_fields");
        let mut custom_fields: CustomFields = map
            .into_iter()
            .filter(|(key, value)| !KNOWN_FIELDS.contains(&key.as_str()) && !value.is_null())
            .collect();

        // Explicit custom fields win over stray top-level keys.
        match nested {
            Some(Value::Object(fields)) => {
                custom_fields.extend(fields.into_iter().filter(|(_, v)| !v.is_null()));
            }
            Some(Value::Null) | None => {}
            Some(other) => {
                custom_fields.insert("custom_fields".into(), other);
            }
        }

        Ok(Self {
            name,
            email,
            phone,
            message,
            source,
            custom_fields,
            idempotency_hint,
        })
    }
}

/// Read a scalar field as trimmed text. Blank and null become `None`.
fn text_field(map: &Map<String, Value>, key: &str) -> Result<Option<String>, IntakeError> {
    let text = match map.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => s.trim().to_string(),
        // Phone numbers and ids often arrive as JSON numbers.
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(_) => {
            return Err(IntakeError::Validation(format!(
                "{key} must be a string"
            )));
        }
    };
    Ok(Some(text).filter(|t| !t.is_empty()))
}
