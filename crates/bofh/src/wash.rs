//! Response normalization and argument escaping.
//!
//! bofhd cannot send `None` over XML-RPC, so it marks strings: a lone
//! sentinel means null, and any string that really starts with the sentinel
//! is sent with one extra sentinel in front.

use crate::value::Value;

/// Marker character used by bofhd for null and escaped strings.
pub const SENTINEL: char = ':';

/// Normalize a raw server response.
///
/// Consumes the value, so structures owned by the caller are never touched.
pub fn wash(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(wash).collect()),
        Value::Struct(members) => {
            Value::Struct(members.into_iter().map(|(k, v)| (k, wash(v))).collect())
        }
        Value::String(s) => wash_str(s),
        other => other,
    }
}

fn wash_str(s: String) -> Value {
    match s.strip_prefix(SENTINEL) {
        Some("") => Value::Nil,
        Some(rest) => Value::String(rest.to_string()),
        None => Value::String(s),
    }
}

/// Escape an outgoing argument so that [`wash`] on the server side restores it.
pub fn escape(value: Value) -> Value {
    match value {
        Value::Nil => Value::String(SENTINEL.to_string()),
        Value::String(s) if s.starts_with(SENTINEL) => Value::String(format!("{SENTINEL}{s}")),
        Value::Array(items) => Value::Array(items.into_iter().map(escape).collect()),
        Value::Struct(members) => {
            Value::Struct(members.into_iter().map(|(k, v)| (k, escape(v))).collect())
        }
        other => other,
    }
}
