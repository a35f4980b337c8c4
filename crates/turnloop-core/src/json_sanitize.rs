//! Defensive JSON text sanitization for file-backed stores (spec §9,
//! SPEC_FULL.md §C.2): replaces lone UTF-16 surrogate code points with
//! U+FFFD so persisted JSON always round-trips as valid text even when a
//! string's content started life as bytes of uncertain provenance.
//!
//! Rust `String`s are guaranteed valid UTF-8 already, so the lone-surrogate
//! case this guards against can only arise when content was decoded with
//! replacement elsewhere in the pipeline (e.g. `String::from_utf8_lossy`
//! already replaces invalid bytes with U+FFFD, which itself is a valid
//! scalar value). This pass is therefore a no-op for well-formed `String`s
//! and exists to keep the sanitizer in the pipeline for any code path that
//! assembles text from raw component parts.

use serde_json::Value;

pub fn sanitize_json_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.clone()),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_json_value).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), sanitize_json_value(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}
