use serde_json::json;

use crate::types::Value;
use crate::wire::to_hex;

/// Render a decoded event as the client-facing JSON envelope:
/// `{"channel": ..., "fingerprint": ..., "event": ...}`.
pub fn encode_event_json(channel: &str, fingerprint_hex: &str, event: &Value) -> String {
  json!({
    "channel": channel,
    "fingerprint": fingerprint_hex,
    "event": value_to_json(event),
  })
  .to_string()
}

/// Fold a [`Value`] tree into JSON.
///
/// Sub-structs recurse, sequences become arrays, byte sequences become
/// lowercase hex strings. NaN maps to `null`: sensor streams routinely
/// carry NaN placeholders and strict JSON has no spelling for them.
/// Infinities get the same treatment.
pub fn value_to_json(value: &Value) -> serde_json::Value {
  match value {
    Value::Boolean(v) => json!(v),
    Value::Int(v) => json!(v),
    Value::Float(v) => serde_json::Number::from_f64(*v)
      .map(serde_json::Value::Number)
      .unwrap_or(serde_json::Value::Null),
    Value::String(v) => json!(v),
    Value::Bytes(v) => json!(to_hex(v)),
    Value::List(items) => {
      serde_json::Value::Array(items.iter().map(value_to_json).collect())
    }
    Value::Struct(fields) => serde_json::Value::Object(
      fields
        .iter()
        .map(|(name, v)| (name.clone(), value_to_json(v)))
        .collect(),
    ),
  }
}
