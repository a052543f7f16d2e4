//! JSON cleanup helpers shared by the normalizers.

use serde_json::Value;

/// Strip null-valued object fields recursively, descending into arrays.
/// The upstream schema validator rejects explicit nulls inside tool
/// arguments, so they are removed rather than forwarded.
pub fn remove_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, remove_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(remove_nulls).collect()),
        other => other,
    }
}
