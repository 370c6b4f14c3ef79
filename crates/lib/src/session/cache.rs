//! Build-result cache for pinned descriptors.
//!
//! An entry stores the files a descriptor contributed to the install tree,
//! keyed by a fingerprint of everything the build depends on: the descriptor,
//! the fact set, the fetched source and the keys of its direct
//! dependencies. A completion marker records the content hash of the stored files;
//! entries whose hash no longer matches are ignored.
//!
//! ```text
//! <build cache>/<name>-<key>/
//!   .kiln-complete
//!   files/embedded/lib/libsds_go.so
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::consts::BUILD_COMPLETE_MARKER;
use crate::descriptor::{SoftwareDescriptor, StepAction};
use crate::placeholder::mentions_install_dir;
use crate::predicate::FactSet;
use crate::util::fs::remove_dir_if_exists;
use crate::util::hash::{ContentHash, DirHashError, Fingerprint, fingerprint, hash_directory};

const MARKER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache I/O error at {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error("failed to serialize cache data: {0}")]
  Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
  move |source| CacheError::Io {
    path: path.to_path_buf(),
    source,
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheMarker {
  version: u32,
  status: String,
  content_hash: String,
  files: Vec<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  revision: Option<String>,
}

/// A verified cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
  /// Directory holding the stored files, laid out like the install root.
  pub files_dir: PathBuf,
  /// Stored files relative to `files_dir`.
  pub files: Vec<PathBuf>,
  pub revision: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuildCache {
  root: PathBuf,
}

/// Whether a descriptor's result may be cached.
///
/// Requires a pinned version and that every install-tree write is a declared
/// copy step; a command mentioning `install_dir` could write anywhere.
pub fn is_cacheable(descriptor: &SoftwareDescriptor) -> bool {
  if descriptor.version().is_floating() {
    return false;
  }
  descriptor.steps().iter().all(|step| match &step.action {
    StepAction::Command { command } => {
      !mentions_install_dir(command) && !step.env.values().any(|v| mentions_install_dir(v))
    }
    StepAction::Copy { .. } => true,
  })
}

impl BuildCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Key for one build of `descriptor`.
  ///
  /// `source` is the content hash of the fetched tree and `revision` the
  /// fetched commit or archive digest. `dependencies` maps each direct
  /// dependency to its own key, so a rebuilt dependency invalidates its
  /// dependents.
  pub fn key(
    descriptor: &SoftwareDescriptor,
    facts: &FactSet,
    source: &ContentHash,
    revision: Option<&str>,
    dependencies: &BTreeMap<String, Fingerprint>,
  ) -> Result<Fingerprint, CacheError> {
    Ok(fingerprint(&(descriptor, facts, source, revision, dependencies))?)
  }

  fn entry_dir(&self, name: &str, key: &Fingerprint) -> PathBuf {
    self.root.join(format!("{}-{}", name, key))
  }

  /// Find a verified entry. Missing, unreadable or tampered entries are
  /// misses.
  pub fn lookup(&self, name: &str, key: &Fingerprint) -> Option<CacheHit> {
    let entry = self.entry_dir(name, key);
    let content = fs::read_to_string(entry.join(BUILD_COMPLETE_MARKER)).ok()?;
    let marker: CacheMarker = serde_json::from_str(&content).ok()?;
    if marker.version != MARKER_VERSION || marker.status != "complete" {
      return None;
    }

    let files_dir = entry.join("files");
    let actual = match hash_directory(&files_dir, &[]) {
      Ok(hash) => hash,
      Err(e) => {
        warn!(name, error = %e, "cache entry unreadable");
        return None;
      }
    };
    if actual.0 != marker.content_hash {
      warn!(name, expected = %marker.content_hash, actual = %actual, "cache entry hash mismatch, ignoring");
      return None;
    }

    debug!(name, key = %key, "build cache hit");
    Some(CacheHit {
      files_dir,
      files: marker.files,
      revision: marker.revision,
    })
  }

  /// Store `files` (relative to `install_root`) as the entry for `key`.
  ///
  /// The entry is assembled in a temporary directory and renamed into
  /// place, so readers never see a partial entry.
  pub fn store(
    &self,
    name: &str,
    key: &Fingerprint,
    install_root: &Path,
    files: &[PathBuf],
    revision: Option<String>,
  ) -> Result<(), CacheError> {
    fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
    let staging = tempfile::TempDir::new_in(&self.root).map_err(io_err(&self.root))?;
    let files_dir = staging.path().join("files");
    fs::create_dir_all(&files_dir).map_err(io_err(&files_dir))?;

    for rel in files {
      let src = install_root.join(rel);
      let dst = files_dir.join(rel);
      if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
      }
      fs::copy(&src, &dst).map_err(io_err(&src))?;
    }

    let marker = CacheMarker {
      version: MARKER_VERSION,
      status: "complete".to_string(),
      content_hash: hash_directory(&files_dir, &[])?.0,
      files: files.to_vec(),
      revision,
    };
    let marker_path = staging.path().join(BUILD_COMPLETE_MARKER);
    fs::write(&marker_path, serde_json::to_string_pretty(&marker)?).map_err(io_err(&marker_path))?;

    let entry = self.entry_dir(name, key);
    remove_dir_if_exists(&entry).map_err(io_err(&entry))?;
    let staged = staging.keep();
    fs::rename(&staged, &entry).map_err(io_err(&entry))?;

    debug!(name, key = %key, files = files.len(), "stored build result");
    Ok(())
  }
}
