use crate::consts::{APP_NAME, CACHE_DIR_ENV};
use std::path::PathBuf;

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for cache files for the application.
///
/// `KILN_CACHE_DIR` takes precedence over the platform default.
pub fn cache_dir() -> PathBuf {
  if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
    return PathBuf::from(dir);
  }
  default_cache_dir()
}

#[cfg(windows)]
fn default_cache_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
    .join("Cache")
}

#[cfg(not(windows))]
fn default_cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Clone cache for git sources.
pub fn git_cache_dir() -> PathBuf {
  cache_dir().join("git")
}

/// Build-result cache for pinned descriptors.
pub fn build_cache_dir() -> PathBuf {
  cache_dir().join("builds")
}
