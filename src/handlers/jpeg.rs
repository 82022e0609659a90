use crate::errors::ProxyError;
use crate::handlers::{Frame, Handler};
use crate::image::{decoder_for, DownsamplingMjpegEncoder, ImageEncoder, PixelFormat};
use crate::types::packages::ImageMessage;

/// Transcodes `image_t` events into JPEG binary frames.
///
/// Every stage can fail on live sensor data (wrong type on the channel,
/// exotic pixel format, truncated buffer); each failure is logged and
/// dropped without disturbing the stream.
#[derive(Debug)]
pub struct JpegHandler {
  encoder: DownsamplingMjpegEncoder,
}

impl JpegHandler {
  /// `quality` is clamped to `[0, 100]`; `scale` of 1.0 disables resizing.
  pub fn new(scale: f32, quality: i64) -> Self {
    let quality = quality.clamp(0, 100) as u8;
    Self {
      encoder: DownsamplingMjpegEncoder::new(scale, quality),
    }
  }

  /// JPEG bytes for an already-parsed image message, or `None` on any
  /// logged codec failure. Shared with the Dial handler.
  pub(crate) fn transcode(&self, channel: &str, message: &ImageMessage) -> Option<Vec<u8>> {
    let format = match PixelFormat::try_from(message.pixelformat) {
      Ok(format) => format,
      Err(e) => {
        log::warn!("{}", e);
        return None;
      }
    };
    let (width, height) = match (u32::try_from(message.width), u32::try_from(message.height)) {
      (Ok(w), Ok(h)) => (w, h),
      _ => {
        log::warn!(
          "image on channel {} has invalid dimensions {}x{}",
          channel,
          message.width,
          message.height
        );
        return None;
      }
    };
    let decoder = match decoder_for(format, width, height) {
      Ok(decoder) => decoder,
      Err(e) => {
        log::warn!("{}", e);
        return None;
      }
    };
    let image = match decoder.decode(&message.data) {
      Ok(image) => image,
      Err(e) => {
        log::warn!("failed to decode image from channel {}: {}", channel, e);
        return None;
      }
    };
    match self.encoder.encode(&image) {
      Ok(jpeg) => Some(jpeg),
      Err(e) => {
        log::warn!("failed to encode image as JPEG: {}", e);
        None
      }
    }
  }
}

impl Handler for JpegHandler {
  fn handle(&self, channel: &str, payload: &[u8]) -> Result<Option<Frame>, ProxyError> {
    let message = match ImageMessage::decode(payload) {
      Ok(message) => message,
      Err(e) => {
        log::debug!("failed to decode image_t event from channel {}: {}", channel, e);
        return Ok(None);
      }
    };
    Ok(self.transcode(channel, &message).map(Frame::Binary))
  }
}
