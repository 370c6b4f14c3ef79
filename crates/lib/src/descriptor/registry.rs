use std::collections::BTreeMap;

use tracing::warn;

use super::types::SoftwareDescriptor;

/// Name-keyed descriptor collection for one session.
///
/// Registering a name twice replaces the earlier descriptor
/// (last-loaded-wins), so local software directories can override shared
/// ones.
#[derive(Debug, Clone, Default)]
pub struct Registry {
  descriptors: BTreeMap<String, SoftwareDescriptor>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Add a descriptor, returning the one it replaced.
  pub fn register(&mut self, descriptor: SoftwareDescriptor) -> Option<SoftwareDescriptor> {
    let previous = self.descriptors.insert(descriptor.name().to_string(), descriptor);
    if let Some(prev) = &previous {
      warn!(name = %prev.name(), "descriptor redefined, later definition wins");
    }
    previous
  }

  pub fn get(&self, name: &str) -> Option<&SoftwareDescriptor> {
    self.descriptors.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.descriptors.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.descriptors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.descriptors.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &SoftwareDescriptor> {
    self.descriptors.values()
  }
}

impl FromIterator<SoftwareDescriptor> for Registry {
  fn from_iter<I: IntoIterator<Item = SoftwareDescriptor>>(iter: I) -> Self {
    let mut registry = Registry::new();
    for descriptor in iter {
      registry.register(descriptor);
    }
    registry
  }
}
