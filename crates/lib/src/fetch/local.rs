//! Local directory sources.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::FetchError;
use crate::consts::SOURCE_MARKER;
use crate::platform::paths::home_dir;
use crate::util::fs::{copy_tree, remove_dir_if_exists};

/// Resolve a `local` source location.
///
/// `~` expands to the home directory; relative paths resolve against
/// `base_dir` (the project directory).
pub fn resolve_local_path(location: &str, base_dir: &Path) -> Result<PathBuf, FetchError> {
  let expanded = if let Some(rest) = location.strip_prefix("~/") {
    home_dir().join(rest)
  } else if location == "~" {
    home_dir()
  } else if Path::new(location).is_absolute() {
    PathBuf::from(location)
  } else {
    base_dir.join(location)
  };

  let canonical = dunce::canonicalize(&expanded).map_err(|e| {
    if e.kind() == std::io::ErrorKind::NotFound {
      FetchError::PathNotFound(expanded.clone())
    } else {
      FetchError::io(&expanded, e)
    }
  })?;

  if !canonical.is_dir() {
    return Err(FetchError::PathNotFound(canonical));
  }

  debug!(path = %canonical.display(), "resolved local source");
  Ok(canonical)
}

/// Replace `target` with a copy of `source`, leaving out `.git` and any
/// marker from an earlier fetch.
pub(super) fn copy_local(source: &Path, target: &Path) -> Result<(), FetchError> {
  remove_dir_if_exists(target).map_err(|e| FetchError::io(target, e))?;
  let written = copy_tree(source, target, &[".git", SOURCE_MARKER]).map_err(|e| FetchError::io(target, e))?;
  debug!(source = %source.display(), files = written.len(), "copied local source");
  Ok(())
}
