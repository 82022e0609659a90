//! Built-in type-definition catalog.
//!
//! The Rust analog of walking Python packages for generated LCM classes:
//! a fixed catalog of descriptor sets, resolvable by package name through
//! [`TypeRegistry::discover`](crate::types::TypeRegistry::discover).
//! The spy's stats types live here too, registered explicitly by the apps
//! that publish the virtual channel.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

use crate::errors::ProxyError;
use crate::types::{FieldDescriptor, FieldKind, TypeDescriptor};
use crate::wire::{Reader, Writer};

/// Descriptors for a known package name, or `None` for an unknown one.
pub fn lookup(package: &str) -> Option<Vec<Arc<TypeDescriptor>>> {
  match package {
    "stdlcm" => Some(vec![header_t().clone()]),
    "senlcm" => Some(vec![image_t().clone()]),
    _ => None,
  }
}

/// `stdlcm.header_t`: timestamp plus sequence counter, embedded at the head
/// of most sensor messages.
pub fn header_t() -> &'static Arc<TypeDescriptor> {
  static DESCRIPTOR: OnceLock<Arc<TypeDescriptor>> = OnceLock::new();
  DESCRIPTOR.get_or_init(|| {
    Arc::new(TypeDescriptor::new(
      "header_t",
      vec![
        FieldDescriptor::scalar("timestamp", FieldKind::Int64),
        FieldDescriptor::scalar("sequence", FieldKind::Int64),
      ],
    ))
  })
}

/// `senlcm.image_t`: raw camera frame with a pixel-format enumerant.
pub fn image_t() -> &'static Arc<TypeDescriptor> {
  static DESCRIPTOR: OnceLock<Arc<TypeDescriptor>> = OnceLock::new();
  DESCRIPTOR.get_or_init(|| {
    Arc::new(TypeDescriptor::new(
      "image_t",
      vec![
        FieldDescriptor::scalar("header", FieldKind::Struct(header_t().clone())),
        FieldDescriptor::scalar("width", FieldKind::Int32),
        FieldDescriptor::scalar("height", FieldKind::Int32),
        FieldDescriptor::scalar("row_stride", FieldKind::Int32),
        FieldDescriptor::scalar("pixelformat", FieldKind::Int32),
        FieldDescriptor::scalar("size", FieldKind::Int32),
        FieldDescriptor::variable("data", FieldKind::Byte, "size"),
      ],
    ))
  })
}

/// Per-channel stats record published on the spy channel.
pub fn channel_stats() -> &'static Arc<TypeDescriptor> {
  static DESCRIPTOR: OnceLock<Arc<TypeDescriptor>> = OnceLock::new();
  DESCRIPTOR.get_or_init(|| {
    Arc::new(TypeDescriptor::new(
      "channel_stats",
      vec![
        FieldDescriptor::scalar("channel", FieldKind::String),
        FieldDescriptor::scalar("type", FieldKind::String),
        FieldDescriptor::scalar("num_msgs", FieldKind::Int64),
        FieldDescriptor::scalar("hz", FieldKind::Double),
        FieldDescriptor::scalar("inv_hz", FieldKind::Double),
        FieldDescriptor::scalar("jitter", FieldKind::Double),
        FieldDescriptor::scalar("bandwidth", FieldKind::Double),
        FieldDescriptor::scalar("undecodable", FieldKind::Int64),
      ],
    ))
  })
}

/// The stats table: a counted list of [`channel_stats`] records.
pub fn channel_stats_list() -> &'static Arc<TypeDescriptor> {
  static DESCRIPTOR: OnceLock<Arc<TypeDescriptor>> = OnceLock::new();
  DESCRIPTOR.get_or_init(|| {
    Arc::new(TypeDescriptor::new(
      "channel_stats_list",
      vec![
        FieldDescriptor::scalar("num_channels", FieldKind::Int32),
        FieldDescriptor::variable(
          "channels",
          FieldKind::Struct(channel_stats().clone()),
          "num_channels",
        ),
      ],
    ))
  })
}

/// Typed view of an `image_t` payload.
///
/// The JPEG and Dial handlers sit on the hot path and parse the message
/// directly rather than going through a [`crate::types::Value`] tree.
#[derive(Debug, Clone)]
pub struct ImageMessage {
  pub timestamp: i64,
  pub sequence: i64,
  pub width: i32,
  pub height: i32,
  pub row_stride: i32,
  pub pixelformat: i32,
  pub data: Bytes,
}

impl ImageMessage {
  pub fn decode(payload: &[u8]) -> Result<Self, ProxyError> {
    if payload.len() < 8 {
      return Err(ProxyError::ShortPayload);
    }
    if payload[..8] != image_t().fingerprint() {
      return Err(ProxyError::FingerprintMismatch("image_t".to_string()));
    }
    let mut r = Reader::new(&payload[8..]);
    let timestamp = r.read_i64()?;
    let sequence = r.read_i64()?;
    let width = r.read_i32()?;
    let height = r.read_i32()?;
    let row_stride = r.read_i32()?;
    let pixelformat = r.read_i32()?;
    let size = r.read_i32()?;
    if size < 0 {
      return Err(ProxyError::ValueMismatch {
        field: "size".to_string(),
        expected: "non-negative integer",
      });
    }
    let data = Bytes::copy_from_slice(r.take(size as usize)?);
    Ok(Self {
      timestamp,
      sequence,
      width,
      height,
      row_stride,
      pixelformat,
      data,
    })
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_bytes(&image_t().fingerprint());
    w.write_i64(self.timestamp);
    w.write_i64(self.sequence);
    w.write_i32(self.width);
    w.write_i32(self.height);
    w.write_i32(self.row_stride);
    w.write_i32(self.pixelformat);
    w.write_i32(self.data.len() as i32);
    w.write_bytes(&self.data);
    w.into_inner()
  }
}
