//! Canonical JSON serialization and checksums
//!
//! Checksums and delta equality both depend on a stable rendering: object
//! keys sorted lexicographically at every depth, no insignificant
//! whitespace, serde_json's standard number formatting.

use crate::entry::LedgerEntry;
use crate::{LedgerError, LedgerResult};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Checksum seed for the first entry in the chain
pub const GENESIS_CHECKSUM: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Render a value canonically: sorted keys, compact separators
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key escaping matches serde_json's string rendering
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical rendering, hex-encoded
pub fn checksum_of(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Checksum of an entry: every field except `checksum` itself
pub fn entry_checksum(entry: &LedgerEntry) -> LedgerResult<String> {
    let mut value = serde_json::to_value(entry)
        .map_err(|e| LedgerError::Serialization(format!("Entry serialization error: {}", e)))?;
    if let Some(map) = value.as_object_mut() {
        map.remove("checksum");
    }
    Ok(checksum_of(&value))
}

/// Value equality under canonical rendering
pub fn canonically_equal(a: &Value, b: &Value) -> bool {
    canonical_string(a) == canonical_string(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"cpu": 8, "name": "w1"});
        let b = json!({"name": "w1", "cpu": 8});
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(checksum_of(&a), checksum_of(&b));
    }

    #[test]
    fn nesting_is_sorted_at_every_depth() {
        let a = json!({"outer": {"b": 1, "a": 2}});
        assert_eq!(canonical_string(&a), r#"{"outer":{"a":2,"b":1}}"#);
    }

    #[test]
    fn arrays_preserve_order() {
        let a = json!([3, 1, 2]);
        let b = json!([1, 2, 3]);
        assert_ne!(canonical_string(&a), canonical_string(&b));
    }

    #[test]
    fn scalars_render_like_serde_json() {
        assert_eq!(canonical_string(&json!(null)), "null");
        assert_eq!(canonical_string(&json!(true)), "true");
        assert_eq!(canonical_string(&json!(1.5)), "1.5");
        assert_eq!(canonical_string(&json!("a\"b")), r#""a\"b""#);
    }
}
