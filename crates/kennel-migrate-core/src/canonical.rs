//! Representation-independent JSON serialization used for hashing and reports.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::MigrateError;

/// Rebuild `value` with every object's keys sorted, recursively.
///
/// `serde_json` is built with `preserve_order`, so object key order follows
/// insertion order unless it is normalized here.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(&String, &Value)> = object.iter().collect();
            entries.sort_by(|lhs, rhs| lhs.0.cmp(rhs.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, item) in entries {
                sorted.insert(key.clone(), canonicalize(item));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Compact canonical bytes of `value`.
///
/// # Errors
/// Returns [`MigrateError::Serialization`] when the value cannot be encoded.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, MigrateError> {
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `SHA-256(canonical(entity))` as lowercase hex.
///
/// # Errors
/// Returns [`MigrateError::Serialization`] when the entity cannot be encoded.
pub fn entity_hash(entity: &Value) -> Result<String, MigrateError> {
    Ok(sha256_hex(&canonical_bytes(entity)?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_order_does_not_change_canonical_bytes() -> Result<(), MigrateError> {
        let lhs = json!({"a": 1, "b": 2});
        let rhs = json!({"b": 2, "a": 1});
        assert_eq!(canonical_bytes(&lhs)?, canonical_bytes(&rhs)?);
        assert_eq!(canonical_bytes(&lhs)?, br#"{"a":1,"b":2}"#.to_vec());
        Ok(())
    }

    #[test]
    fn nested_objects_inside_arrays_are_sorted() -> Result<(), MigrateError> {
        let value = json!({"z": [{"y": 1, "x": 2}], "m": {"d": null, "c": true}});
        let bytes = canonical_bytes(&value)?;
        assert_eq!(bytes, br#"{"m":{"c":true,"d":null},"z":[{"x":2,"y":1}]}"#.to_vec());
        Ok(())
    }

    #[test]
    fn array_order_is_significant() -> Result<(), MigrateError> {
        let lhs = json!({"ids": ["a", "b"]});
        let rhs = json!({"ids": ["b", "a"]});
        assert_ne!(entity_hash(&lhs)?, entity_hash(&rhs)?);
        Ok(())
    }

    #[test]
    fn empty_input_hash_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
