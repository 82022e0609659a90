use byteorder::{BigEndian, ByteOrder};

use crate::errors::ProxyError;
use crate::handlers::{Frame, Handler, JpegHandler, JsonHandler};
use crate::types::packages::{image_t, ImageMessage};

/// Composite handler for the Dial webapp: one socket carries both frame
/// kinds.
///
/// `image_t` events become binary frames laid out as
/// `[log header | channel name | JPEG]`; everything else goes through the
/// JSON handler as a text frame. Clients tell them apart by the WebSocket
/// opcode alone.
#[derive(Debug)]
pub struct DialHandler {
  image: JpegHandler,
  json: JsonHandler,
}

/// Size of the serialized lcmlog-style header prefix.
pub const DIAL_HEADER_LEN: usize = 24;

impl DialHandler {
  pub fn new(image: JpegHandler, json: JsonHandler) -> Self {
    Self { image, json }
  }

  /// Build the binary frame for an `image_t` payload.
  ///
  /// A payload that carries the `image_t` fingerprint but fails to parse is
  /// a hard error (propagated); codec failures inside the JPEG pipeline are
  /// already logged and drop the frame.
  fn encode_image_frame(
    &self,
    channel: &str,
    payload: &[u8],
  ) -> Result<Option<Vec<u8>>, ProxyError> {
    let message = ImageMessage::decode(payload)?;
    let Some(jpeg) = self.image.transcode(channel, &message) else {
      return Ok(None);
    };

    // lcmlog header, big-endian: event number (always zero here), the
    // payload's own header timestamp, channel-name length, payload length.
    let channel_utf8 = channel.as_bytes();
    let mut frame = vec![0u8; DIAL_HEADER_LEN];
    BigEndian::write_u64(&mut frame[0..8], 0);
    BigEndian::write_i64(&mut frame[8..16], message.timestamp);
    BigEndian::write_i32(&mut frame[16..20], channel_utf8.len() as i32);
    BigEndian::write_i32(&mut frame[20..24], payload.len() as i32);
    frame.extend_from_slice(channel_utf8);
    frame.extend_from_slice(&jpeg);
    Ok(Some(frame))
  }
}

impl Handler for DialHandler {
  fn handle(&self, channel: &str, payload: &[u8]) -> Result<Option<Frame>, ProxyError> {
    if payload.len() >= 8 && payload[..8] == image_t().fingerprint() {
      Ok(self.encode_image_frame(channel, payload)?.map(Frame::Binary))
    } else {
      self.json.handle(channel, payload)
    }
  }
}
