use thiserror::Error;

use crate::image::PixelFormat;

/// Errors surfaced by the proxy library.
///
/// Downstream failures never propagate upstream: handlers and drain loops
/// log and drop, so most of these kinds terminate at the call site that
/// produced them.
#[derive(Debug, Error)]
pub enum ProxyError {
  #[error("truncated payload: needed {needed} more bytes, {remaining} left")]
  Truncated { needed: usize, remaining: usize },

  #[error("payload shorter than an 8-byte fingerprint")]
  ShortPayload,

  #[error("{0} trailing bytes after decoding all fields")]
  TrailingBytes(usize),

  #[error("invalid UTF-8 in encoded string")]
  InvalidString,

  #[error("variable-length field references unknown length field '{0}'")]
  UnknownLengthField(String),

  #[error("field '{field}' does not match its declared kind ({expected})")]
  ValueMismatch { field: String, expected: &'static str },

  #[error("fingerprint mismatch: payload is not a '{0}'")]
  FingerprintMismatch(String),

  #[error("unknown LCM package '{0}'")]
  UnknownPackage(String),

  #[error("unknown pixel format enumerant {0}")]
  UnknownPixelFormat(i32),

  #[error("unsupported pixel format: {0}")]
  UnsupportedPixelFormat(PixelFormat),

  #[error("image codec: {0}")]
  ImageCodec(String),

  #[error("LCM bus: {0}")]
  Bus(String),

  #[error("websocket: {0}")]
  WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}
