//! The shared install tree.
//!
//! Every descriptor of a session writes into one install root. All writes go
//! through [`InstallTree::copy_into`], which rejects paths escaping the root,
//! serializes writes per resolved target and tracks what each descriptor
//! contributed so a partial build can be told apart from a complete one.
//!
//! A path belongs to the first descriptor that writes it; a second descriptor
//! writing the same path is a [`InstallError::Conflict`]. Commands that write
//! into the root directly run under [`InstallTree::track_writes`], which
//! attributes whatever they created or changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::consts::INSTALL_LAYOUT;
use crate::util::fs::{contained_relative, copy_tree};

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("unsafe install path '{path}' from '{descriptor}'")]
  UnsafePath { descriptor: String, path: String },

  #[error("copy source does not exist: {}", .path.display())]
  SourceMissing { path: PathBuf },

  #[error("install I/O error at {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("'{descriptor}' would overwrite {} owned by '{owner}'", .path.display())]
  Conflict {
    descriptor: String,
    path: PathBuf,
    owner: String,
  },

  #[error("install task failed: {0}")]
  Join(String),
}

impl InstallError {
  fn io(path: &Path, source: io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Completion status of one descriptor's contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
  InProgress,
  Complete,
  Incomplete,
}

/// Files a descriptor wrote, relative to the install root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
  pub status: InstallStatus,
  pub paths: BTreeSet<PathBuf>,
}

/// Serializable summary of an install tree, handed over with the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
  pub root: PathBuf,
  pub descriptors: BTreeMap<String, Contribution>,
}

impl InstallRecord {
  pub fn is_complete(&self) -> bool {
    self
      .descriptors
      .values()
      .all(|c| c.status == InstallStatus::Complete)
  }

  pub fn write(&self, path: &Path) -> Result<(), InstallError> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(self).map_err(|e| InstallError::io(path, io::Error::other(e)))?;
    fs::write(path, json).map_err(|e| InstallError::io(path, e))
  }
}

#[derive(Debug)]
pub struct InstallTree {
  root: PathBuf,
  contributions: Mutex<BTreeMap<String, Contribution>>,
  dest_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
  /// Shared by copies, held exclusively while a tracked command runs.
  writes: tokio::sync::RwLock<()>,
}

impl InstallTree {
  /// Create the install root and its fixed layout.
  pub fn create(root: &Path) -> Result<Self, InstallError> {
    for dir in INSTALL_LAYOUT {
      let path = root.join(dir);
      fs::create_dir_all(&path).map_err(|e| InstallError::io(&path, e))?;
    }
    let root = std::path::absolute(root).map_err(|e| InstallError::io(root, e))?;
    info!(root = %root.display(), "install tree ready");

    Ok(Self {
      root,
      contributions: Mutex::new(BTreeMap::new()),
      dest_locks: Mutex::new(HashMap::new()),
      writes: tokio::sync::RwLock::new(()),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Mark a descriptor as building. Clears any earlier contribution record.
  pub fn begin(&self, descriptor: &str) {
    self.contributions().insert(
      descriptor.to_string(),
      Contribution {
        status: InstallStatus::InProgress,
        paths: BTreeSet::new(),
      },
    );
  }

  pub fn mark_complete(&self, descriptor: &str) {
    self.set_status(descriptor, InstallStatus::Complete);
  }

  pub fn mark_incomplete(&self, descriptor: &str) {
    warn!(descriptor, "install contribution left incomplete");
    self.set_status(descriptor, InstallStatus::Incomplete);
  }

  fn set_status(&self, descriptor: &str, status: InstallStatus) {
    self
      .contributions()
      .entry(descriptor.to_string())
      .or_insert_with(|| Contribution {
        status,
        paths: BTreeSet::new(),
      })
      .status = status;
  }

  pub fn status(&self, descriptor: &str) -> Option<InstallStatus> {
    self.contributions().get(descriptor).map(|c| c.status)
  }

  /// Paths written by `descriptor`, relative to the root.
  pub fn contributed(&self, descriptor: &str) -> Vec<PathBuf> {
    self
      .contributions()
      .get(descriptor)
      .map(|c| c.paths.iter().cloned().collect())
      .unwrap_or_default()
  }

  pub fn record(&self) -> InstallRecord {
    InstallRecord {
      root: self.root.clone(),
      descriptors: self.contributions().clone(),
    }
  }

  /// Copy `source` into the tree at `relative_dest`, on behalf of `descriptor`.
  ///
  /// Follows `cp` semantics: when the destination is an existing directory
  /// or ends with a separator, the source lands inside it under its own
  /// file name. Directories are copied recursively. Returns the written
  /// paths relative to the root.
  ///
  /// Fails with [`InstallError::Conflict`] before touching the tree if any
  /// written path already belongs to another descriptor.
  pub async fn copy_into(
    &self,
    descriptor: &str,
    source: &Path,
    relative_dest: &str,
  ) -> Result<Vec<PathBuf>, InstallError> {
    let rel = contained_relative(relative_dest).ok_or_else(|| InstallError::UnsafePath {
      descriptor: descriptor.to_string(),
      path: relative_dest.to_string(),
    })?;
    let into_dir = relative_dest.ends_with('/') || relative_dest.ends_with('\\') || rel.as_os_str().is_empty();
    let dest = self.root.join(&rel);

    let _writes = self.writes.read().await;

    let root = self.root.clone();
    let source = source.to_path_buf();
    let plan = tokio::task::spawn_blocking(move || CopyPlan::resolve(source, &dest, into_dir, &root))
      .await
      .map_err(|e| InstallError::Join(e.to_string()))??;

    let lock = self.dest_lock(&plan.target);
    let _guard = lock.lock().await;

    let claimed = self.claim(descriptor, &plan.files)?;
    let files = plan.files.clone();
    let copied = tokio::task::spawn_blocking(move || plan.execute())
      .await
      .map_err(|e| InstallError::Join(e.to_string()))
      .and_then(|result| result);
    if let Err(e) = copied {
      self.release(descriptor, &claimed);
      return Err(e);
    }

    debug!(descriptor, dest = relative_dest, files = files.len(), "copied into install tree");
    Ok(files)
  }

  /// Run `work` with the tree to itself and attribute every file it creates
  /// or modifies to `descriptor`.
  ///
  /// Used for commands that write below the root directly. Changes are
  /// detected by size and modification time. Returns the output of `work`
  /// with the attributed paths, relative to the root.
  pub async fn track_writes<F>(&self, descriptor: &str, work: F) -> Result<(F::Output, Vec<PathBuf>), InstallError>
  where
    F: Future,
  {
    let _writes = self.writes.write().await;

    let before = self.snapshot().await?;
    let output = work.await;
    let after = self.snapshot().await?;

    let changed: Vec<PathBuf> = after
      .into_iter()
      .filter(|(path, stamp)| before.get(path) != Some(stamp))
      .map(|(path, _)| path)
      .collect();
    if !changed.is_empty() {
      debug!(descriptor, files = changed.len(), "attributed command writes");
    }
    self.claim(descriptor, &changed)?;

    Ok((output, changed))
  }

  async fn snapshot(&self) -> Result<BTreeMap<PathBuf, FileStamp>, InstallError> {
    let root = self.root.clone();
    tokio::task::spawn_blocking(move || snapshot_tree(&root))
      .await
      .map_err(|e| InstallError::Join(e.to_string()))?
  }

  /// Record `paths` as written by `descriptor`. Returns the paths that were
  /// not already recorded for it.
  fn claim(&self, descriptor: &str, paths: &[PathBuf]) -> Result<Vec<PathBuf>, InstallError> {
    let mut contributions = self.contributions();
    for path in paths {
      let owner = contributions
        .iter()
        .find(|(name, c)| name.as_str() != descriptor && c.paths.contains(path));
      if let Some((owner, _)) = owner {
        warn!(descriptor, owner = %owner, path = %path.display(), "install path conflict");
        return Err(InstallError::Conflict {
          descriptor: descriptor.to_string(),
          path: path.clone(),
          owner: owner.clone(),
        });
      }
    }

    let entry = contributions
      .entry(descriptor.to_string())
      .or_insert_with(|| Contribution {
        status: InstallStatus::InProgress,
        paths: BTreeSet::new(),
      });
    Ok(paths.iter().filter(|p| entry.paths.insert((*p).clone())).cloned().collect())
  }

  fn release(&self, descriptor: &str, paths: &[PathBuf]) {
    if let Some(entry) = self.contributions().get_mut(descriptor) {
      for path in paths {
        entry.paths.remove(path);
      }
    }
  }

  fn contributions(&self) -> MutexGuard<'_, BTreeMap<String, Contribution>> {
    self.contributions.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn dest_lock(&self, dest: &Path) -> Arc<tokio::sync::Mutex<()>> {
    self
      .dest_locks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .entry(dest.to_path_buf())
      .or_default()
      .clone()
  }
}

/// A copy with its final target and the root-relative files it will write.
#[derive(Debug)]
struct CopyPlan {
  source: PathBuf,
  target: PathBuf,
  is_dir: bool,
  files: Vec<PathBuf>,
}

impl CopyPlan {
  fn resolve(source: PathBuf, dest: &Path, into_dir: bool, root: &Path) -> Result<Self, InstallError> {
    let meta = fs::metadata(&source).map_err(|_| InstallError::SourceMissing { path: source.clone() })?;

    let target = if into_dir || dest.is_dir() {
      match source.file_name() {
        Some(name) => dest.join(name),
        None => dest.to_path_buf(),
      }
    } else {
      dest.to_path_buf()
    };

    let written = if meta.is_dir() {
      let mut written = Vec::new();
      for entry in WalkDir::new(&source).sort_by_file_name() {
        let entry = entry.map_err(|e| InstallError::io(&source, io::Error::other(e)))?;
        if entry.file_type().is_dir() {
          continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(&source) {
          written.push(target.join(rel));
        }
      }
      written
    } else {
      vec![target.clone()]
    };

    let files = written
      .into_iter()
      .filter_map(|p| p.strip_prefix(root).ok().map(Path::to_path_buf))
      .collect();

    Ok(Self {
      source,
      target,
      is_dir: meta.is_dir(),
      files,
    })
  }

  fn execute(self) -> Result<(), InstallError> {
    if self.is_dir {
      copy_tree(&self.source, &self.target, &[]).map_err(|e| InstallError::io(&self.target, e))?;
      return Ok(());
    }

    if let Some(parent) = self.target.parent() {
      fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
    }
    fs::copy(&self.source, &self.target).map_err(|e| InstallError::io(&self.target, e))?;
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
  len: u64,
  modified: Option<SystemTime>,
}

/// Files and symlinks under `root`, keyed by root-relative path.
fn snapshot_tree(root: &Path) -> Result<BTreeMap<PathBuf, FileStamp>, InstallError> {
  let mut stamps = BTreeMap::new();
  for entry in WalkDir::new(root) {
    let entry = entry.map_err(|e| InstallError::io(root, io::Error::other(e)))?;
    if entry.file_type().is_dir() {
      continue;
    }
    let meta = entry.path().symlink_metadata().map_err(|e| InstallError::io(entry.path(), e))?;
    if let Ok(rel) = entry.path().strip_prefix(root) {
      stamps.insert(
        rel.to_path_buf(),
        FileStamp {
          len: meta.len(),
          modified: meta.modified().ok(),
        },
      );
    }
  }
  Ok(stamps)
}
