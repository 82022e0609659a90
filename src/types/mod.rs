//! Dynamic LCM type descriptors.
//!
//! LCM messages are self-describing only through their leading 8-byte
//! fingerprint; everything after it is a flat field encoding that can only
//! be interpreted against the matching type definition. A [`TypeDescriptor`]
//! carries that definition and interprets payloads into [`Value`] trees
//! (and back), so the proxy can transcode types it has never been compiled
//! against.

mod json;
pub mod packages;
mod registry;

pub use json::{encode_event_json, value_to_json};
pub use registry::TypeRegistry;

use std::sync::Arc;

use crate::errors::ProxyError;
use crate::wire::{to_hex, Reader, Writer};

/// A decoded LCM value.
///
/// Integers of every width widen to `i64`; both float widths widen to `f64`.
/// Byte sequences are kept apart from integer lists so they can render as
/// hex strings downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Boolean(bool),
  Int(i64),
  Float(f64),
  String(String),
  Bytes(Vec<u8>),
  List(Vec<Value>),
  Struct(Vec<(String, Value)>),
}

impl Value {
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Int(v) => Some(*v),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Float(v) => Some(*v),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(v) => Some(v),
      _ => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Value::Bytes(v) => Some(v),
      _ => None,
    }
  }

  /// Field lookup on a struct value.
  pub fn get(&self, field: &str) -> Option<&Value> {
    match self {
      Value::Struct(fields) => {
        fields.iter().find(|(n, _)| n == field).map(|(_, v)| v)
      }
      _ => None,
    }
  }
}

/// Primitive and composite field kinds of the LCM type language.
#[derive(Debug, Clone)]
pub enum FieldKind {
  Boolean,
  /// Unsigned octet. Sequences of these decode to [`Value::Bytes`].
  Byte,
  Int8,
  Int16,
  Int32,
  Int64,
  Float,
  Double,
  String,
  Struct(Arc<TypeDescriptor>),
}

impl FieldKind {
  fn token(&self) -> &'static str {
    match self {
      FieldKind::Boolean => "boolean",
      FieldKind::Byte => "byte",
      FieldKind::Int8 => "int8_t",
      FieldKind::Int16 => "int16_t",
      FieldKind::Int32 => "int32_t",
      FieldKind::Int64 => "int64_t",
      FieldKind::Float => "float",
      FieldKind::Double => "double",
      FieldKind::String => "string",
      FieldKind::Struct(_) => "struct",
    }
  }
}

/// Cardinality of a field.
#[derive(Debug, Clone)]
pub enum Dimension {
  Scalar,
  Fixed(usize),
  /// Length given by a previously declared integer field of the same struct.
  Variable(String),
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
  pub name: String,
  pub kind: FieldKind,
  pub dimension: Dimension,
}

impl FieldDescriptor {
  pub fn scalar(name: &str, kind: FieldKind) -> Self {
    Self {
      name: name.to_string(),
      kind,
      dimension: Dimension::Scalar,
    }
  }

  pub fn fixed(name: &str, kind: FieldKind, len: usize) -> Self {
    Self {
      name: name.to_string(),
      kind,
      dimension: Dimension::Fixed(len),
    }
  }

  pub fn variable(name: &str, kind: FieldKind, length_field: &str) -> Self {
    Self {
      name: name.to_string(),
      kind,
      dimension: Dimension::Variable(length_field.to_string()),
    }
  }
}

/// An LCM type definition: printable name, ordered fields, and the
/// fingerprint that keys it in a [`TypeRegistry`].
///
/// The fingerprint is derived from the definition itself (field names,
/// kinds, and dimensions, combined recursively for nested structs and
/// finished with a single left-rotate), so two descriptors agree on their
/// fingerprint iff they agree on the definition. Externally pinned types
/// can override it with [`TypeDescriptor::with_fingerprint`].
#[derive(Debug)]
pub struct TypeDescriptor {
  fingerprint: [u8; 8],
  hash: u64,
  name: String,
  fields: Vec<FieldDescriptor>,
}

impl TypeDescriptor {
  pub fn new(name: &str, fields: Vec<FieldDescriptor>) -> Self {
    let hash = definition_hash(&fields);
    Self {
      fingerprint: hash.to_be_bytes(),
      hash,
      name: name.to_string(),
      fields,
    }
  }

  /// Same definition, explicit fingerprint.
  pub fn with_fingerprint(name: &str, fields: Vec<FieldDescriptor>, fingerprint: [u8; 8]) -> Self {
    let mut td = Self::new(name, fields);
    td.fingerprint = fingerprint;
    td
  }

  pub fn fingerprint(&self) -> [u8; 8] {
    self.fingerprint
  }

  pub fn fingerprint_hex(&self) -> String {
    to_hex(&self.fingerprint)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn fields(&self) -> &[FieldDescriptor] {
    &self.fields
  }

  /// Decode a full payload (fingerprint included) into a value tree.
  ///
  /// The payload must carry this descriptor's fingerprint and exactly the
  /// bytes of its fields; trailing garbage is treated as corruption.
  pub fn decode(&self, payload: &[u8]) -> Result<Value, ProxyError> {
    if payload.len() < 8 {
      return Err(ProxyError::ShortPayload);
    }
    if payload[..8] != self.fingerprint {
      return Err(ProxyError::FingerprintMismatch(self.name.clone()));
    }
    let mut reader = Reader::new(&payload[8..]);
    let value = self.decode_fields(&mut reader)?;
    if reader.remaining() > 0 {
      return Err(ProxyError::TrailingBytes(reader.remaining()));
    }
    Ok(value)
  }

  /// Encode a value tree into a full payload, fingerprint first.
  pub fn encode(&self, value: &Value) -> Result<Vec<u8>, ProxyError> {
    let mut writer = Writer::new();
    writer.write_bytes(&self.fingerprint);
    self.encode_fields(value, &mut writer)?;
    Ok(writer.into_inner())
  }

  /// Decode the field section only. Nested structs encode without their
  /// own fingerprints, so this is also the recursion step.
  pub(crate) fn decode_fields(&self, reader: &mut Reader<'_>) -> Result<Value, ProxyError> {
    let mut decoded: Vec<(String, Value)> = Vec::with_capacity(self.fields.len());
    for field in &self.fields {
      let value = match &field.dimension {
        Dimension::Scalar => decode_one(&field.kind, reader)?,
        Dimension::Fixed(len) => decode_sequence(&field.kind, *len, reader)?,
        Dimension::Variable(length_field) => {
          let len = lookup_length(&decoded, length_field)?;
          decode_sequence(&field.kind, len, reader)?
        }
      };
      decoded.push((field.name.clone(), value));
    }
    Ok(Value::Struct(decoded))
  }

  fn encode_fields(&self, value: &Value, writer: &mut Writer) -> Result<(), ProxyError> {
    let Value::Struct(entries) = value else {
      return Err(ProxyError::ValueMismatch {
        field: self.name.clone(),
        expected: "struct",
      });
    };
    for field in &self.fields {
      let value = entries
        .iter()
        .find(|(n, _)| *n == field.name)
        .map(|(_, v)| v)
        .ok_or_else(|| ProxyError::ValueMismatch {
          field: field.name.clone(),
          expected: "present",
        })?;
      match &field.dimension {
        Dimension::Scalar => encode_one(field, value, writer)?,
        Dimension::Fixed(len) => encode_sequence(field, value, *len, writer)?,
        Dimension::Variable(length_field) => {
          let len = lookup_length(entries, length_field)?;
          encode_sequence(field, value, len, writer)?;
        }
      }
    }
    Ok(())
  }
}

fn lookup_length(decoded: &[(String, Value)], length_field: &str) -> Result<usize, ProxyError> {
  let value = decoded
    .iter()
    .find(|(n, _)| n == length_field)
    .map(|(_, v)| v)
    .ok_or_else(|| ProxyError::UnknownLengthField(length_field.to_string()))?;
  match value.as_i64() {
    Some(len) if len >= 0 => Ok(len as usize),
    _ => Err(ProxyError::ValueMismatch {
      field: length_field.to_string(),
      expected: "non-negative integer",
    }),
  }
}

fn decode_one(kind: &FieldKind, reader: &mut Reader<'_>) -> Result<Value, ProxyError> {
  Ok(match kind {
    FieldKind::Boolean => Value::Boolean(reader.read_bool()?),
    FieldKind::Byte => Value::Int(i64::from(reader.read_u8()?)),
    FieldKind::Int8 => Value::Int(i64::from(reader.read_i8()?)),
    FieldKind::Int16 => Value::Int(i64::from(reader.read_i16()?)),
    FieldKind::Int32 => Value::Int(i64::from(reader.read_i32()?)),
    FieldKind::Int64 => Value::Int(reader.read_i64()?),
    FieldKind::Float => Value::Float(f64::from(reader.read_f32()?)),
    FieldKind::Double => Value::Float(reader.read_f64()?),
    FieldKind::String => Value::String(reader.read_string()?),
    FieldKind::Struct(td) => td.decode_fields(reader)?,
  })
}

fn decode_sequence(kind: &FieldKind, len: usize, reader: &mut Reader<'_>) -> Result<Value, ProxyError> {
  if matches!(kind, FieldKind::Byte) {
    return Ok(Value::Bytes(reader.take(len)?.to_vec()));
  }
  let mut items = Vec::with_capacity(len);
  for _ in 0..len {
    items.push(decode_one(kind, reader)?);
  }
  Ok(Value::List(items))
}

fn encode_one(field: &FieldDescriptor, value: &Value, writer: &mut Writer) -> Result<(), ProxyError> {
  let mismatch = || ProxyError::ValueMismatch {
    field: field.name.clone(),
    expected: field.kind.token(),
  };
  match (&field.kind, value) {
    (FieldKind::Boolean, Value::Boolean(v)) => writer.write_bool(*v),
    (FieldKind::Byte, Value::Int(v)) => writer.write_u8(u8::try_from(*v).map_err(|_| mismatch())?),
    (FieldKind::Int8, Value::Int(v)) => writer.write_i8(i8::try_from(*v).map_err(|_| mismatch())?),
    (FieldKind::Int16, Value::Int(v)) => {
      writer.write_i16(i16::try_from(*v).map_err(|_| mismatch())?)
    }
    (FieldKind::Int32, Value::Int(v)) => {
      writer.write_i32(i32::try_from(*v).map_err(|_| mismatch())?)
    }
    (FieldKind::Int64, Value::Int(v)) => writer.write_i64(*v),
    (FieldKind::Float, Value::Float(v)) => writer.write_f32(*v as f32),
    (FieldKind::Double, Value::Float(v)) => writer.write_f64(*v),
    (FieldKind::String, Value::String(v)) => writer.write_string(v),
    (FieldKind::Struct(td), v @ Value::Struct(_)) => td.encode_fields(v, writer)?,
    _ => return Err(mismatch()),
  }
  Ok(())
}

fn encode_sequence(
  field: &FieldDescriptor,
  value: &Value,
  len: usize,
  writer: &mut Writer,
) -> Result<(), ProxyError> {
  if matches!(field.kind, FieldKind::Byte) {
    let bytes = value.as_bytes().ok_or_else(|| ProxyError::ValueMismatch {
      field: field.name.clone(),
      expected: "bytes",
    })?;
    if bytes.len() != len {
      return Err(ProxyError::ValueMismatch {
        field: field.name.clone(),
        expected: "declared length",
      });
    }
    writer.write_bytes(bytes);
    return Ok(());
  }
  let Value::List(items) = value else {
    return Err(ProxyError::ValueMismatch {
      field: field.name.clone(),
      expected: "list",
    });
  };
  if items.len() != len {
    return Err(ProxyError::ValueMismatch {
      field: field.name.clone(),
      expected: "declared length",
    });
  }
  for item in items {
    encode_one(field, item, writer)?;
  }
  Ok(())
}

fn definition_hash(fields: &[FieldDescriptor]) -> u64 {
  let mut h: u64 = 0x1234_5678;
  for field in fields {
    h = hash_update(h, field.name.as_bytes());
    h = match &field.kind {
      FieldKind::Struct(td) => h.wrapping_add(td.hash).rotate_left(1),
      kind => hash_update(h, kind.token().as_bytes()),
    };
    h = match &field.dimension {
      Dimension::Scalar => hash_update(h, &[0]),
      Dimension::Fixed(len) => {
        let h = hash_update(h, &[1]);
        hash_update(h, &(*len as u64).to_be_bytes())
      }
      Dimension::Variable(name) => {
        let h = hash_update(h, &[2]);
        hash_update(h, name.as_bytes())
      }
    };
  }
  h.rotate_left(1)
}

fn hash_update(mut h: u64, bytes: &[u8]) -> u64 {
  for &b in bytes {
    h = ((h << 8) ^ (h >> 55)).wrapping_add(u64::from(b));
  }
  h
}

#[cfg(test)]
mod tests {
  use super::*;

  fn point() -> Arc<TypeDescriptor> {
    Arc::new(TypeDescriptor::new(
      "point_t",
      vec![
        FieldDescriptor::scalar("x", FieldKind::Double),
        FieldDescriptor::scalar("y", FieldKind::Double),
      ],
    ))
  }

  fn track() -> TypeDescriptor {
    TypeDescriptor::new(
      "track_t",
      vec![
        FieldDescriptor::scalar("name", FieldKind::String),
        FieldDescriptor::scalar("num_points", FieldKind::Int32),
        FieldDescriptor::variable("points", FieldKind::Struct(point()), "num_points"),
        FieldDescriptor::scalar("crc_len", FieldKind::Int32),
        FieldDescriptor::variable("crc", FieldKind::Byte, "crc_len"),
      ],
    )
  }

  fn track_value() -> Value {
    Value::Struct(vec![
      ("name".into(), Value::String("alpha".into())),
      ("num_points".into(), Value::Int(2)),
      (
        "points".into(),
        Value::List(vec![
          Value::Struct(vec![
            ("x".into(), Value::Float(1.0)),
            ("y".into(), Value::Float(-2.5)),
          ]),
          Value::Struct(vec![
            ("x".into(), Value::Float(0.0)),
            ("y".into(), Value::Float(7.25)),
          ]),
        ]),
      ),
      ("crc_len".into(), Value::Int(3)),
      ("crc".into(), Value::Bytes(vec![0xde, 0xad, 0x01])),
    ])
  }

  #[test]
  fn round_trip_nested_variable_length() {
    let td = track();
    let payload = td.encode(&track_value()).unwrap();
    assert_eq!(&payload[..8], &td.fingerprint());
    assert_eq!(td.decode(&payload).unwrap(), track_value());
  }

  #[test]
  fn fingerprint_tracks_the_definition() {
    let a = TypeDescriptor::new(
      "a",
      vec![FieldDescriptor::scalar("x", FieldKind::Int32)],
    );
    let b = TypeDescriptor::new(
      "b",
      vec![FieldDescriptor::scalar("x", FieldKind::Int32)],
    );
    let c = TypeDescriptor::new(
      "c",
      vec![FieldDescriptor::scalar("x", FieldKind::Int64)],
    );
    // The name is printable metadata; only fields feed the fingerprint.
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint(), c.fingerprint());
  }

  #[test]
  fn trailing_bytes_are_corruption() {
    let td = track();
    let mut payload = td.encode(&track_value()).unwrap();
    payload.push(0xff);
    assert!(matches!(
      td.decode(&payload),
      Err(ProxyError::TrailingBytes(1))
    ));
  }

  #[test]
  fn wrong_fingerprint_is_rejected() {
    let td = track();
    let mut payload = td.encode(&track_value()).unwrap();
    payload[0] ^= 0xff;
    assert!(td.decode(&payload).is_err());
  }

  #[test]
  fn explicit_fingerprint_overrides_the_hash() {
    let fp = [1, 2, 3, 4, 5, 6, 7, 8];
    let td = TypeDescriptor::with_fingerprint(
      "pinned",
      vec![FieldDescriptor::scalar("x", FieldKind::Int32)],
      fp,
    );
    assert_eq!(td.fingerprint(), fp);
    assert_eq!(td.fingerprint_hex(), "0102030405060708");
  }
}
