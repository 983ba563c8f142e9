//! Canonical JSON serialization for signing and hashing.
//!
//! Every seal signature is computed over the canonical encoding of its
//! payload, and verifiers recompute that encoding from stored fields alone.
//! Any ambiguity in the encoding would invalidate otherwise-good seals, so
//! this module pins a single deterministic byte string for any accepted
//! value:
//!
//! - Object keys are emitted in strictly ascending byte order
//! - Arrays preserve element order
//! - Numbers are integers in the signed 64-bit range, emitted in plain
//!   decimal; floats are rejected outright (signed payloads never carry them)
//! - Strings use minimal escaping: only `"`, `\` and the C0 control range
//! - No insignificant whitespace
//! - Duplicate object keys are rejected rather than silently collapsed
//! - Nesting is bounded to prevent stack exhaustion on adversarial input
//!
//! The encoding is a fixed point: `canonicalize(s) == s` for any `s` this
//! module emits.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Maximum nesting depth accepted by the canonicalizer.
pub const MAX_DEPTH: usize = 128;

/// Errors produced while canonicalizing a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A floating-point number was encountered.
    ///
    /// Signed payloads require exact representation, so only integers are
    /// admitted.
    #[error("float not allowed in canonical encoding")]
    FloatNotAllowed,

    /// A number is outside the signed 64-bit integer range.
    #[error("number out of range: {value} does not fit in a signed 64-bit integer")]
    NumberOutOfRange {
        /// Textual form of the offending number.
        value: String,
    },

    /// An object contained the same key twice.
    #[error("duplicate key '{key}' in object")]
    DuplicateKey {
        /// The duplicated key.
        key: String,
    },

    /// The value nests deeper than [`MAX_DEPTH`] levels.
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,

    /// The input is not valid JSON.
    #[error("invalid JSON: {message}")]
    Parse {
        /// Parser diagnostic.
        message: String,
    },
}

/// Canonicalizes a JSON text.
///
/// Parses `input`, validates it against the canonical profile, and emits the
/// unique canonical form.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the input is not valid JSON, contains
/// floats, numbers outside the `i64` range, duplicate object keys, or nests
/// deeper than [`MAX_DEPTH`] levels.
pub fn canonicalize(input: &str) -> Result<String, CanonicalError> {
    let value = parse_rejecting_duplicates(input)?;
    canonicalize_value(&value)
}

/// Canonicalizes an already-parsed value.
///
/// This is the entry point used when the payload is assembled in memory
/// (seal payloads) rather than received as text.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value contains floats, numbers outside
/// the `i64` range, or nests deeper than [`MAX_DEPTH`] levels.
pub fn canonicalize_value(value: &Value) -> Result<String, CanonicalError> {
    validate(value, 0)?;
    let mut out = String::new();
    emit(value, &mut out);
    Ok(out)
}

/// Returns true if `input` is already in canonical form.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    canonicalize(input).is_ok_and(|c| c == input)
}

/// Parses JSON while rejecting duplicate object keys.
///
/// Stock parsers accept duplicate keys with last-value-wins semantics, which
/// would let two distinct inputs share a canonical form. Duplicates are
/// detected on *decoded* keys so escape variants like `"a"` cannot
/// smuggle a collision past the check.
fn parse_rejecting_duplicates(input: &str) -> Result<Value, CanonicalError> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    let checked = CheckedValue::deserialize(&mut deserializer).map_err(|e| {
        let message = e.to_string();
        message.strip_prefix("duplicate key: ").map_or(
            CanonicalError::Parse {
                message: message.clone(),
            },
            |rest| CanonicalError::DuplicateKey {
                // serde_json appends " at line X column Y" to custom errors.
                key: rest.split(" at line ").next().unwrap_or(rest).to_string(),
            },
        )
    })?;
    Ok(checked.0)
}

/// JSON value wrapper whose deserializer fails on duplicate object keys.
struct CheckedValue(Value);

impl<'de> Deserialize<'de> for CheckedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CheckedVisitor;

        impl<'de> Visitor<'de> for CheckedVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("any JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Number::from_f64(v)
                    .map(Value::Number)
                    .ok_or_else(|| de::Error::custom("non-finite float"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E> {
                Ok(Value::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Self::Value, E> {
                Ok(Value::String(v))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Value::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<CheckedValue>()? {
                    items.push(item.0);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut seen = BTreeSet::new();
                let mut object = Map::new();
                while let Some(key) = map.next_key::<String>()? {
                    if !seen.insert(key.clone()) {
                        return Err(de::Error::custom(format!("duplicate key: {key}")));
                    }
                    let value = map.next_value::<CheckedValue>()?;
                    object.insert(key, value.0);
                }
                Ok(Value::Object(object))
            }
        }

        deserializer.deserialize_any(CheckedVisitor).map(CheckedValue)
    }
}

/// Recursively validates a value against the canonical profile.
fn validate(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::TooDeep);
    }

    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => validate_number(n),
        Value::Array(items) => {
            for item in items {
                validate(item, depth + 1)?;
            }
            Ok(())
        },
        Value::Object(object) => {
            for item in object.values() {
                validate(item, depth + 1)?;
            }
            Ok(())
        },
    }
}

/// Validates that a number is an integer within `i64` range.
fn validate_number(n: &Number) -> Result<(), CanonicalError> {
    if n.is_i64() {
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        if u > i64::MAX as u64 {
            return Err(CanonicalError::NumberOutOfRange {
                value: u.to_string(),
            });
        }
        return Ok(());
    }
    Err(CanonicalError::FloatNotAllowed)
}

/// Emits a validated value in canonical form.
fn emit(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, out),
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit(item, out);
            }
            out.push(']');
        },
        Value::Object(object) => emit_object(object, out),
    }
}

fn emit_number(n: &Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else {
        // Unreachable after validation; emit something parseable regardless.
        out.push_str(&n.to_string());
    }
}

/// Emits a string with minimal escaping.
///
/// Only `"` and `\` and the C0 control range (U+0000..U+001F) are escaped.
/// BS/FF/LF/CR/TAB use their short forms; the rest of the range uses
/// `\uXXXX`. Everything else is passed through as UTF-8.
fn emit_string(s: &str, out: &mut String) {
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
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            },
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Emits an object with keys in ascending byte order.
fn emit_object(object: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = object.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_string(key, out);
        out.push(':');
        emit(&object[*key], out);
    }
    out.push('}');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_object_keys() {
        let out = canonicalize(r#"{"z": 1, "a": 2, "m": 3}"#).unwrap();
        assert_eq!(out, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn sorts_nested_objects() {
        let out = canonicalize(r#"{"outer": {"z": 1, "a": 2}}"#).unwrap();
        assert_eq!(out, r#"{"outer":{"a":2,"z":1}}"#);
    }

    #[test]
    fn preserves_array_order() {
        assert_eq!(canonicalize("[3, 1, 2]").unwrap(), "[3,1,2]");
    }

    #[test]
    fn strips_whitespace() {
        let out = canonicalize("{\n  \"key\" :  \"value\" ,\n  \"num\" : 42\n}").unwrap();
        assert_eq!(out, r#"{"key":"value","num":42}"#);
    }

    #[test]
    fn primitives_pass_through() {
        assert_eq!(canonicalize("null").unwrap(), "null");
        assert_eq!(canonicalize("true").unwrap(), "true");
        assert_eq!(canonicalize("false").unwrap(), "false");
        assert_eq!(canonicalize("42").unwrap(), "42");
        assert_eq!(canonicalize("-7").unwrap(), "-7");
        assert_eq!(canonicalize(r#""hi""#).unwrap(), r#""hi""#);
    }

    #[test]
    fn output_is_a_fixed_point() {
        let inputs = [
            r#"{"z": 1, "a": 2}"#,
            r#"{"nested": {"b": 2, "a": 1}, "top": "v"}"#,
            r#"[1, 2, {"y": 3, "x": 4}]"#,
        ];
        for input in inputs {
            let once = canonicalize(input).unwrap();
            let twice = canonicalize(&once).unwrap();
            assert_eq!(once, twice, "not a fixed point for {input}");
        }
    }

    #[test]
    fn is_canonical_checks() {
        assert!(is_canonical(r#"{"a":1,"b":2}"#));
        assert!(!is_canonical(r#"{"b":2,"a":1}"#));
        assert!(!is_canonical(r#"{ "a": 1 }"#));
    }

    #[test]
    fn rejects_floats() {
        assert!(matches!(
            canonicalize(r#"{"x": 1.5}"#),
            Err(CanonicalError::FloatNotAllowed)
        ));
        assert!(matches!(
            canonicalize("[1, 2.5]"),
            Err(CanonicalError::FloatNotAllowed)
        ));
        assert!(matches!(
            canonicalize(r#"{"x": 1e10}"#),
            Err(CanonicalError::FloatNotAllowed)
        ));
    }

    #[test]
    fn accepts_i64_bounds() {
        assert!(canonicalize(&format!(r#"{{"x": {}}}"#, i64::MAX)).is_ok());
        assert!(canonicalize(&format!(r#"{{"x": {}}}"#, i64::MIN)).is_ok());
    }

    #[test]
    fn rejects_above_i64_max() {
        let above = (i64::MAX as u64) + 1;
        assert!(matches!(
            canonicalize(&format!(r#"{{"x": {above}}}"#)),
            Err(CanonicalError::NumberOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_keys() {
        assert!(matches!(
            canonicalize(r#"{"a": 1, "a": 2}"#),
            Err(CanonicalError::DuplicateKey { key }) if key == "a"
        ));
    }

    #[test]
    fn rejects_duplicate_keys_after_unescaping() {
        // "\u0061" decodes to "a", so these keys collide.
        assert!(matches!(
            canonicalize(r#"{"a": 1, "\u0061": 2}"#),
            Err(CanonicalError::DuplicateKey { key }) if key == "a"
        ));
    }

    #[test]
    fn same_key_in_sibling_objects_is_fine() {
        assert!(canonicalize(r#"{"a": {"x": 1}, "b": {"x": 2}}"#).is_ok());
    }

    #[test]
    fn rejects_excessive_depth() {
        let mut json = String::from("0");
        for _ in 0..200 {
            json = format!(r#"{{"n": {json}}}"#);
        }
        let result = canonicalize(&json);
        assert!(matches!(
            result,
            Err(CanonicalError::TooDeep | CanonicalError::Parse { .. })
        ));
    }

    #[test]
    fn escapes_control_characters() {
        let out = canonicalize(r#"{"t": "a\nb\tc"}"#).unwrap();
        assert_eq!(out, r#"{"t":"a\nb\tc"}"#);

        let value = serde_json::json!({ "t": "\u{0001}" });
        assert_eq!(canonicalize_value(&value).unwrap(), "{\"t\":\"\\u0001\"}");
    }

    #[test]
    fn does_not_escape_beyond_c0() {
        // U+007F and non-ASCII pass through raw.
        let value = serde_json::json!({ "t": "\u{007F}é中" });
        let out = canonicalize_value(&value).unwrap();
        assert!(out.contains('\u{007F}'));
        assert!(out.contains('é'));
        assert!(out.contains('中'));
    }

    #[test]
    fn equivalent_inputs_share_canonical_form() {
        let a = canonicalize(r#"{"z": {"c": 3, "a": 1}, "a": [1, {"y": 1, "x": 2}]}"#).unwrap();
        let b = canonicalize(r#"{"a": [1, {"x": 2, "y": 1}], "z": {"a": 1, "c": 3}}"#).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(matches!(
            canonicalize("not json"),
            Err(CanonicalError::Parse { .. })
        ));
        assert!(matches!(
            canonicalize(r#"{"key":"#),
            Err(CanonicalError::Parse { .. })
        ));
    }

    #[test]
    fn empty_containers() {
        assert_eq!(canonicalize("{}").unwrap(), "{}");
        assert_eq!(canonicalize("[]").unwrap(), "[]");
        assert_eq!(canonicalize(r#""""#).unwrap(), r#""""#);
    }
}
