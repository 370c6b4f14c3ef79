use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One successfully built descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub name: String,
  pub version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub license: Option<String>,
}

impl ManifestEntry {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
      source_revision: None,
      license: None,
    }
  }
}

/// Receives version entries as descriptors finish.
///
/// Called from concurrent build tasks, hence `&self`.
pub trait ManifestSink: Send + Sync {
  fn record(&self, entry: ManifestEntry);
}

/// Collects entries keyed by name and writes them as JSON.
#[derive(Debug, Default)]
pub struct VersionManifest {
  entries: Mutex<BTreeMap<String, ManifestEntry>>,
}

impl VersionManifest {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn entries(&self) -> BTreeMap<String, ManifestEntry> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }

  pub fn get(&self, name: &str) -> Option<ManifestEntry> {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
  }

  pub fn len(&self) -> usize {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&self.entries())
  }

  pub fn write(&self, path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent)?;
    }
    let json = self.to_json().map_err(io::Error::other)?;
    fs::write(path, json)?;
    debug!(path = %path.display(), entries = self.len(), "wrote version manifest");
    Ok(())
  }
}

impl ManifestSink for VersionManifest {
  fn record(&self, entry: ManifestEntry) {
    self
      .entries
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(entry.name.clone(), entry);
  }
}
