//! Transcoding handlers.
//!
//! A handler turns one `(channel, payload)` event into at most one
//! client-facing frame. Returning `Ok(None)` drops the message quietly
//! (already logged at the appropriate level); returning `Err` marks an
//! unexpected failure that the drain loop logs at error level and drops.

mod dial;
mod json;
mod jpeg;

pub use dial::DialHandler;
pub use json::JsonHandler;
pub use jpeg::JpegHandler;

use tokio_tungstenite::tungstenite::Message;

use crate::errors::ProxyError;

/// A frame bound for a WebSocket client. The text/binary split maps onto
/// the WebSocket frame opcode, never onto content sniffing.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
  Text(String),
  Binary(Vec<u8>),
}

impl Frame {
  pub(crate) fn into_message(self) -> Message {
    match self {
      Frame::Text(text) => Message::Text(text.into()),
      Frame::Binary(data) => Message::Binary(data.into()),
    }
  }
}

/// Transform an event into a client frame, or drop it.
pub trait Handler: Send + Sync {
  fn handle(&self, channel: &str, payload: &[u8]) -> Result<Option<Frame>, ProxyError>;
}
