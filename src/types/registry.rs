use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ProxyError;
use crate::types::{packages, TypeDescriptor, Value};

/// Registry of LCM type descriptors, keyed by fingerprint.
///
/// Registering a descriptor whose fingerprint is already present replaces
/// the prior binding (last write wins).
#[derive(Debug, Default)]
pub struct TypeRegistry {
  by_fingerprint: HashMap<[u8; 8], Arc<TypeDescriptor>>,
}

impl TypeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, descriptor: Arc<TypeDescriptor>) {
    self.by_fingerprint.insert(descriptor.fingerprint(), descriptor);
  }

  /// Register every descriptor of a named built-in package.
  ///
  /// Returns the number of descriptors registered, or an error for a name
  /// the catalog does not know.
  pub fn discover(&mut self, package: &str) -> Result<usize, ProxyError> {
    let descriptors = packages::lookup(package)
      .ok_or_else(|| ProxyError::UnknownPackage(package.to_string()))?;
    let count = descriptors.len();
    for descriptor in descriptors {
      self.register(descriptor);
    }
    Ok(count)
  }

  pub fn get(&self, fingerprint: &[u8; 8]) -> Option<&Arc<TypeDescriptor>> {
    self.by_fingerprint.get(fingerprint)
  }

  /// All registered descriptors, in no particular order.
  pub fn types(&self) -> Vec<Arc<TypeDescriptor>> {
    self.by_fingerprint.values().cloned().collect()
  }

  pub fn is_empty(&self) -> bool {
    self.by_fingerprint.is_empty()
  }

  pub fn clear(&mut self) {
    self.by_fingerprint.clear();
  }

  /// Decode a payload against the registered descriptors.
  ///
  /// Returns `None` both for unknown fingerprints and for corrupt payloads
  /// of a known type; the latter is logged at debug level. This never
  /// panics on hostile input.
  pub fn decode(&self, payload: &[u8]) -> Option<(Arc<TypeDescriptor>, Value)> {
    if payload.len() < 8 {
      return None;
    }
    let mut fingerprint = [0u8; 8];
    fingerprint.copy_from_slice(&payload[..8]);
    let descriptor = self.by_fingerprint.get(&fingerprint)?;
    match descriptor.decode(payload) {
      Ok(value) => Some((Arc::clone(descriptor), value)),
      Err(e) => {
        log::debug!("failed to decode '{}' payload: {}", descriptor.name(), e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{FieldDescriptor, FieldKind};

  fn sample(name: &str) -> Arc<TypeDescriptor> {
    Arc::new(TypeDescriptor::new(
      name,
      vec![FieldDescriptor::scalar("value", FieldKind::Int32)],
    ))
  }

  #[test]
  fn duplicate_fingerprint_last_write_wins() {
    let mut registry = TypeRegistry::new();
    let first = sample("first");
    let second = sample("second");
    assert_eq!(first.fingerprint(), second.fingerprint());

    registry.register(first.clone());
    registry.register(second);
    let got = registry.get(&first.fingerprint()).unwrap();
    assert_eq!(got.name(), "second");
    assert_eq!(registry.types().len(), 1);
  }

  #[test]
  fn unknown_fingerprint_decodes_to_none() {
    let registry = TypeRegistry::new();
    assert!(registry.decode(&[0xab; 16]).is_none());
    assert!(registry.decode(&[0xab; 3]).is_none());
  }

  #[test]
  fn corrupt_payload_of_known_type_decodes_to_none() {
    let mut registry = TypeRegistry::new();
    let td = sample("sample");
    registry.register(td.clone());

    let mut payload = td.fingerprint().to_vec();
    payload.extend_from_slice(&[0, 0]); // int32 truncated
    assert!(registry.decode(&payload).is_none());
  }

  #[test]
  fn discover_builtin_packages() {
    let mut registry = TypeRegistry::new();
    assert!(registry.discover("stdlcm").unwrap() >= 1);
    assert!(registry.discover("senlcm").unwrap() >= 1);
    assert!(registry.discover("nonexistent").is_err());
    assert!(!registry.is_empty());
  }
}
