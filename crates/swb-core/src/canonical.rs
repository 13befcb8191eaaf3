// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic JSON canonicalization and digests.
//!
//! Any signing or hashing over canonical messages goes through
//! [`canonicalize`]: object keys sorted by Unicode code point, compact
//! separators, RFC 8785 string escaping. Numbers print through
//! `serde_json`'s shortest-round-trip formatter, which is deterministic and
//! parse-faithful but spells some floats differently than full JCS would
//! (`2.0` where JCS prints `2`). Digests are therefore stable across this
//! codebase, not across arbitrary JCS implementations.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::UnifiedMessage;

/// Produce the canonical byte-exact JSON string for `value`.
///
/// Deterministic: equal JSON values canonicalize identically regardless of
/// the key insertion order they were built with.
///
/// # Examples
///
/// ```
/// use serde_json::json;
///
/// let a = json!({"b": 1, "a": [true, null]});
/// assert_eq!(swb_core::canonical::canonicalize(&a), r#"{"a":[true,null],"b":1}"#);
/// ```
#[must_use]
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(s, out),
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
        Value::Object(map) => {
            // Sort by code point. Byte order over UTF-8 strings is code-point
            // order, so a plain sort on &str suffices.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                // Key came from the map, the value is always present.
                if let Some(v) = map.get(key.as_str()) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
    }
}

/// JCS string escaping: the two mandatory escapes, the short forms for
/// control characters that have them, and `\u00XX` for the rest.
fn write_escaped(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Errors from canonicalization of typed values.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// The value could not be serialized to JSON.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Canonicalize any serializable value.
///
/// # Errors
///
/// Returns [`CanonicalError::Json`] if the value cannot be serialized.
pub fn canonicalize_typed<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let v = serde_json::to_value(value)?;
    Ok(canonicalize(&v))
}

/// Compute the canonical SHA-256 digest of a message envelope.
///
/// # Errors
///
/// Returns [`CanonicalError::Json`] if the envelope cannot be serialized.
pub fn message_digest(msg: &UnifiedMessage) -> Result<String, CanonicalError> {
    let canonical = canonicalize_typed(msg)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_output() {
        let a: Value = serde_json::from_str(r#"{"z":1,"a":2,"m":{"y":0,"b":1}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"m":{"b":1,"y":0},"a":2,"z":1}"#).unwrap();
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn output_is_compact() {
        let v = json!({"a": [1, 2], "b": "x"});
        assert_eq!(canonicalize(&v), r#"{"a":[1,2],"b":"x"}"#);
    }

    #[test]
    fn roundtrip_preserves_value() {
        let v = json!({
            "nested": {"deep": [null, true, 1.5, "s"]},
            "n": -42,
            "u": "héllo \n\t\"quoted\""
        });
        let parsed: Value = serde_json::from_str(&canonicalize(&v)).unwrap();
        assert_eq!(parsed, v);
    }

    #[test]
    fn control_characters_escape_as_unicode() {
        let v = json!("a\u{0001}b");
        assert_eq!(canonicalize(&v), "\"a\\u0001b\"");
    }

    #[test]
    fn short_escapes_used_where_defined() {
        let v = json!("\u{0008}\u{000C}\n\r\t\"\\");
        assert_eq!(canonicalize(&v), r#""\b\f\n\r\t\"\\""#);
    }

    #[test]
    fn non_ascii_passes_through_unescaped() {
        let v = json!({"κ": "λ"});
        assert_eq!(canonicalize(&v), "{\"κ\":\"λ\"}");
    }

    #[test]
    fn digest_is_stable_for_equal_envelopes() {
        let msg = crate::UnifiedMessage::user_text("hello");
        let a = message_digest(&msg).unwrap();
        let b = message_digest(&msg).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
