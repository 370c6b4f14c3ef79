//! Source materialization.
//!
//! [`fetch`] turns a descriptor's [`SourceRef`] into a populated working
//! directory:
//! - `git`: clone cache under the git cache dir, tree exported at the
//!   resolved revision
//! - `local`: directory copy, `.git` excluded
//! - `url`: single download verified against its sha256
//! - `none`: empty directory
//!
//! Every successful fetch leaves a `.kiln-source` marker in the target
//! recording the revision and content hash. A later fetch of a pinned
//! version whose marker and content still match is reused as-is.

mod git;
mod local;
mod url;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::consts::SOURCE_MARKER;
use crate::descriptor::{SourceKind, SourceRef, VersionSpec};
use crate::util::fs::remove_dir_if_exists;
use crate::util::hash::{ContentHash, hash_directory};

pub use local::resolve_local_path;
pub use url::url_to_filename;

#[derive(Debug, Error)]
pub enum FetchError {
  /// Transient failure reaching the source. Retried.
  #[error("source unavailable for '{name}': {reason}")]
  SourceUnavailable { name: String, reason: String },

  #[error("revision '{rev}' not found for '{name}'")]
  RevisionNotFound { name: String, rev: String },

  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("local source path does not exist: {}", .0.display())]
  PathNotFound(PathBuf),

  #[error("I/O error at {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("fetch cancelled")]
  Cancelled,

  #[error("fetch task failed: {0}")]
  Join(String),
}

impl FetchError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::SourceUnavailable { .. })
  }

  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    Self::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  pub(crate) fn unavailable(name: &str, reason: impl ToString) -> Self {
    Self::SourceUnavailable {
      name: name.to_string(),
      reason: reason.to_string(),
    }
  }
}

/// Settings shared by every fetch in a session.
#[derive(Debug, Clone)]
pub struct FetchOptions {
  /// Clone cache root for git sources.
  pub git_cache_dir: PathBuf,
  /// Base for relative `local` source paths.
  pub base_dir: PathBuf,
  /// Extra attempts after the first failure.
  pub retries: u32,
  /// Delay before retry `n` is `backoff * n`.
  pub backoff: Duration,
}

/// Result of materializing a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSource {
  pub dir: PathBuf,
  /// Commit id for git, sha256 for url, `None` otherwise.
  pub revision: Option<String>,
  pub content_hash: ContentHash,
  /// Whether an earlier fetch was reused without touching the source.
  pub reused: bool,
}

/// Written into every fetched source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SourceMarker {
  kind: SourceKind,
  location: String,
  version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  revision: Option<String>,
  content_hash: ContentHash,
}

/// Materialize `source` at `version` into `target_dir`, retrying transient
/// failures with linear backoff.
pub async fn fetch(
  name: &str,
  source: &SourceRef,
  version: &VersionSpec,
  target_dir: &Path,
  options: &FetchOptions,
  cancel: &CancelToken,
) -> Result<FetchedSource, FetchError> {
  if let Some(reused) = reusable(source, version, target_dir, options).await {
    info!(name, dir = %target_dir.display(), "reusing fetched source");
    return Ok(reused);
  }

  let mut attempt: u32 = 0;
  loop {
    if cancel.is_cancelled() {
      return Err(FetchError::Cancelled);
    }

    let result = tokio::select! {
      result = fetch_once(name, source, version, target_dir, options) => result,
      _ = cancel.cancelled() => return Err(FetchError::Cancelled),
    };

    match result {
      Ok(fetched) => return Ok(fetched),
      Err(e) if e.is_retryable() && attempt < options.retries => {
        attempt += 1;
        let delay = options.backoff * attempt;
        warn!(name, attempt, retries = options.retries, delay_ms = delay.as_millis() as u64, error = %e, "fetch failed, retrying");
        tokio::select! {
          _ = tokio::time::sleep(delay) => {}
          _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        }
      }
      Err(e) => return Err(e),
    }
  }
}

async fn fetch_once(
  name: &str,
  source: &SourceRef,
  version: &VersionSpec,
  target_dir: &Path,
  options: &FetchOptions,
) -> Result<FetchedSource, FetchError> {
  debug!(name, kind = ?source.kind, location = %source.location, %version, "fetching source");

  let revision = match source.kind {
    SourceKind::Git => {
      let name = name.to_string();
      let url = source.location.clone();
      let version = version.clone();
      let target = target_dir.to_path_buf();
      let cache = options.git_cache_dir.clone();
      let rev = tokio::task::spawn_blocking(move || git::fetch_git(&name, &url, &version, &cache, &target))
        .await
        .map_err(|e| FetchError::Join(e.to_string()))??;
      Some(rev)
    }
    SourceKind::Local => {
      let path = resolve_local_path(&source.location, &options.base_dir)?;
      let target = target_dir.to_path_buf();
      tokio::task::spawn_blocking(move || local::copy_local(&path, &target))
        .await
        .map_err(|e| FetchError::Join(e.to_string()))??;
      None
    }
    SourceKind::Url => {
      let sha256 = source.sha256.clone().unwrap_or_default();
      url::download(name, &source.location, &sha256, target_dir).await?;
      Some(sha256)
    }
    SourceKind::None => {
      remove_dir_if_exists(target_dir).map_err(|e| FetchError::io(target_dir, e))?;
      fs::create_dir_all(target_dir).map_err(|e| FetchError::io(target_dir, e))?;
      None
    }
  };

  let content_hash = content_hash(target_dir).await?;
  let marker = SourceMarker {
    kind: source.kind,
    location: source.location.clone(),
    version: version.to_string(),
    revision: revision.clone(),
    content_hash: content_hash.clone(),
  };
  write_marker(target_dir, &marker)?;

  info!(name, revision = revision.as_deref().unwrap_or("-"), hash = %content_hash, "source ready");

  Ok(FetchedSource {
    dir: target_dir.to_path_buf(),
    revision,
    content_hash,
    reused: false,
  })
}

/// An existing fetch is reusable when the version is pinned (or the source
/// is content-addressed), the marker matches the request and the tree still
/// hashes to the recorded value. Local sources must also still hash the same
/// upstream.
async fn reusable(
  source: &SourceRef,
  version: &VersionSpec,
  target_dir: &Path,
  options: &FetchOptions,
) -> Option<FetchedSource> {
  if version.is_floating() && source.kind != SourceKind::Url {
    return None;
  }
  let marker = read_marker(target_dir)?;
  if marker.kind != source.kind || marker.location != source.location || marker.version != version.as_str() {
    return None;
  }
  let actual = content_hash(target_dir).await.ok()?;
  if actual != marker.content_hash {
    debug!(dir = %target_dir.display(), "source marker stale, refetching");
    return None;
  }
  if source.kind == SourceKind::Local {
    let upstream = resolve_local_path(&source.location, &options.base_dir).ok()?;
    if content_hash(&upstream).await.ok()? != actual {
      debug!(upstream = %upstream.display(), "local source changed, copying again");
      return None;
    }
  }
  Some(FetchedSource {
    dir: target_dir.to_path_buf(),
    revision: marker.revision,
    content_hash: actual,
    reused: true,
  })
}

async fn content_hash(dir: &Path) -> Result<ContentHash, FetchError> {
  let dir = dir.to_path_buf();
  tokio::task::spawn_blocking(move || {
    hash_directory(&dir, &[SOURCE_MARKER, ".git"]).map_err(|e| FetchError::io(&dir, io::Error::other(e)))
  })
  .await
  .map_err(|e| FetchError::Join(e.to_string()))?
}

fn read_marker(dir: &Path) -> Option<SourceMarker> {
  let content = fs::read_to_string(dir.join(SOURCE_MARKER)).ok()?;
  serde_json::from_str(&content).ok()
}

fn write_marker(dir: &Path, marker: &SourceMarker) -> Result<(), FetchError> {
  let path = dir.join(SOURCE_MARKER);
  let json = serde_json::to_string_pretty(marker).map_err(|e| FetchError::io(&path, io::Error::other(e)))?;
  fs::write(&path, json).map_err(|e| FetchError::io(&path, e))
}
