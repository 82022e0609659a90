use std::sync::Arc;

use crate::errors::ProxyError;
use crate::handlers::{Frame, Handler};
use crate::types::{encode_event_json, TypeRegistry};
use crate::wire::to_hex;

/// Decodes events against the type registry and emits the JSON envelope as
/// a text frame. Unknown and corrupt payloads are dropped.
#[derive(Debug)]
pub struct JsonHandler {
  registry: Arc<TypeRegistry>,
}

impl JsonHandler {
  pub fn new(registry: Arc<TypeRegistry>) -> Self {
    Self { registry }
  }
}

impl Handler for JsonHandler {
  fn handle(&self, channel: &str, payload: &[u8]) -> Result<Option<Frame>, ProxyError> {
    let Some((_, value)) = self.registry.decode(payload) else {
      log::debug!("no decodable type for payload on channel {}", channel);
      return Ok(None);
    };
    let fingerprint_hex = to_hex(&payload[..8]);
    Ok(Some(Frame::Text(encode_event_json(
      channel,
      &fingerprint_hex,
      &value,
    ))))
  }
}
