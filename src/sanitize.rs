//! Serialization boundary applied before anything reaches a mirror table.
//!
//! Documents coming from the UI layer may carry client-only state (`$`-prefixed
//! keys such as `$selected` or `$file`) and prototype-chain keys from loosely
//! typed payloads. Both are stripped here so that only plain data is persisted.

use serde_json::{Map, Value};
use thiserror::Error;

/// A sanitized JSON object as stored in a mirror table.
pub type Document = Map<String, Value>;

/// Maximum nesting (objects and arrays) accepted in a document.
pub const MAX_DOCUMENT_DEPTH: usize = 32;

const PROTOTYPE_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("document must be a JSON object")]
    NotAnObject,

    #[error("document nesting depth {depth} exceeds {MAX_DOCUMENT_DEPTH}")]
    TooDeep { depth: usize },

    #[error("document _id must be a non-empty string")]
    InvalidId,
}

fn is_stripped_key(key: &str) -> bool {
    key.starts_with('$') || PROTOTYPE_KEYS.contains(&key)
}

fn clean_value(value: Value, depth: usize) -> Result<Value, SanitizeError> {
    match value {
        Value::Object(map) => Ok(Value::Object(clean_map(map, depth)?)),
        Value::Array(items) => {
            check_depth(depth)?;
            items
                .into_iter()
                .map(|item| clean_value(item, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        scalar => Ok(scalar),
    }
}

/// Scalars do not count as a level; only objects and arrays do.
fn check_depth(depth: usize) -> Result<(), SanitizeError> {
    if depth > MAX_DOCUMENT_DEPTH {
        return Err(SanitizeError::TooDeep { depth });
    }
    Ok(())
}

fn clean_map(map: Document, depth: usize) -> Result<Document, SanitizeError> {
    check_depth(depth)?;
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if is_stripped_key(&key) {
            continue;
        }
        out.insert(key, clean_value(value, depth + 1)?);
    }
    Ok(out)
}

/// Validate and strip a payload into a storable document.
pub fn sanitize_document(value: Value) -> Result<Document, SanitizeError> {
    let Value::Object(map) = value else {
        return Err(SanitizeError::NotAnObject);
    };
    let doc = clean_map(map, 1)?;
    match doc.get("_id") {
        None => {}
        Some(Value::String(id)) if !id.trim().is_empty() => {}
        Some(_) => return Err(SanitizeError::InvalidId),
    }
    Ok(doc)
}

/// Best-effort identifier of a payload that failed sanitization.
/// Numeric ids are accepted and rendered as decimal strings.
pub fn salvage_id(value: &Value) -> Option<String> {
    match value.get("_id").or_else(|| value.get("id"))? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Row written in place of a document that could not be sanitized.
pub fn placeholder_document(id: &str) -> Document {
    let mut doc = Map::new();
    doc.insert("_id".into(), Value::String(id.to_string()));
    doc.insert("_placeholder".into(), Value::Bool(true));
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested(depth: usize) -> Value {
        let mut v = json!("leaf");
        for _ in 0..depth {
            v = json!({ "n": v });
        }
        v
    }

    #[test]
    fn test_strips_transient_and_prototype_keys_at_all_depths() {
        let doc = sanitize_document(json!({
            "_id": "inv-1",
            "$selected": true,
            "__proto__": { "polluted": true },
            "lines": [
                { "amount": 10, "$editing": true, "constructor": "x" }
            ],
            "customer": { "name": "Acme", "prototype": {} }
        }))
        .unwrap();

        assert_eq!(
            Value::Object(doc),
            json!({
                "_id": "inv-1",
                "lines": [{ "amount": 10 }],
                "customer": { "name": "Acme" }
            })
        );
    }

    #[test]
    fn test_plain_document_round_trips_unchanged() {
        let input = json!({
            "_id": "rec-9",
            "date": "2026-03-01",
            "amount": 1250.5,
            "tags": ["water", "march"],
            "meta": { "ocr": { "confidence": 0.91 } },
            "notes": null
        });
        let doc = sanitize_document(input.clone()).unwrap();
        assert_eq!(Value::Object(doc), input);
    }

    #[test]
    fn test_rejects_non_objects_and_bad_ids() {
        assert_eq!(sanitize_document(json!([1, 2])), Err(SanitizeError::NotAnObject));
        assert_eq!(
            sanitize_document(json!({ "_id": 42 })),
            Err(SanitizeError::InvalidId)
        );
        assert_eq!(
            sanitize_document(json!({ "_id": "  " })),
            Err(SanitizeError::InvalidId)
        );
    }

    #[test]
    fn test_depth_limit() {
        assert!(sanitize_document(nested(MAX_DOCUMENT_DEPTH - 1)).is_ok());
        assert!(sanitize_document(nested(MAX_DOCUMENT_DEPTH)).is_ok());
        assert!(matches!(
            sanitize_document(nested(MAX_DOCUMENT_DEPTH + 1)),
            Err(SanitizeError::TooDeep { depth }) if depth == MAX_DOCUMENT_DEPTH + 1
        ));
        let in_array = json!({ "items": [nested(MAX_DOCUMENT_DEPTH - 2)] });
        assert!(sanitize_document(in_array).is_ok());
    }

    #[test]
    fn test_salvage_and_placeholder() {
        let bad = json!({ "id": "cust-3", "deep": nested(40) });
        assert_eq!(salvage_id(&bad).as_deref(), Some("cust-3"));
        assert_eq!(salvage_id(&json!({ "_id": 42 })).as_deref(), Some("42"));
        assert_eq!(salvage_id(&json!({ "id": " " })), None);
        let placeholder = placeholder_document("cust-3");
        assert_eq!(
            Value::Object(placeholder),
            json!({ "_id": "cust-3", "_placeholder": true })
        );
    }
}
