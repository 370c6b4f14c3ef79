//! The immutable fact set a session evaluates predicates against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::platform::arch::Arch;
use crate::platform::os::Os;

/// Named boolean facts about the build target, gathered once per session.
///
/// Built-in facts are derived from the target [`Platform`]; additional facts
/// can be layered on with [`FactSet::with_fact`] before the session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSet {
  facts: BTreeMap<String, bool>,
}

impl FactSet {
  /// An empty fact set. Every lookup against it is unknown.
  pub fn new() -> Self {
    Self::default()
  }

  /// Built-in facts for a target platform.
  pub fn for_platform(platform: Platform) -> Self {
    let mut facts = BTreeMap::new();
    facts.insert("linux_target".to_string(), platform.os == Os::Linux);
    facts.insert("osx_target".to_string(), platform.os == Os::MacOs);
    facts.insert("windows_target".to_string(), platform.os == Os::Windows);
    facts.insert("unix_target".to_string(), platform.os.is_unix());
    facts.insert("x86_64_target".to_string(), platform.arch == Arch::X86_64);
    facts.insert("aarch64_target".to_string(), platform.arch == Arch::Aarch64);
    facts.insert("arm_target".to_string(), platform.arch == Arch::Aarch64);
    Self { facts }
  }

  /// Set (or override) a fact.
  pub fn with_fact(mut self, name: impl Into<String>, value: bool) -> Self {
    self.facts.insert(name.into(), value);
    self
  }

  /// Look up a fact. `None` means the name is unknown.
  pub fn get(&self, name: &str) -> Option<bool> {
    self.facts.get(name).copied()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.facts.contains_key(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
    self.facts.iter().map(|(k, v)| (k.as_str(), *v))
  }

  pub fn len(&self) -> usize {
    self.facts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.facts.is_empty()
  }
}
