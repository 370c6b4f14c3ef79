//! Blocking filesystem helpers shared by the fetcher, the install tree and
//! the build cache. Async callers run these inside `spawn_blocking`.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

/// Normalize a relative path that must stay inside some root.
///
/// Returns `None` for absolute paths, drive prefixes, or any `..` segment,
/// even one that would land back inside the root. `.` segments are dropped.
pub fn contained_relative(path: &str) -> Option<PathBuf> {
  let mut normalized = PathBuf::new();
  for component in Path::new(path).components() {
    match component {
      Component::Normal(part) => normalized.push(part),
      Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
    }
  }
  Some(normalized)
}

/// Recursively copy `src` into `dst`, skipping entries named in `exclude`.
///
/// `dst` is created if needed. Existing files are overwritten. Symlinks are
/// recreated on Unix and followed elsewhere. Returns the destination paths of
/// every file (and symlink) written, in walk order.
pub fn copy_tree(src: &Path, dst: &Path, exclude: &[&str]) -> io::Result<Vec<PathBuf>> {
  let mut written = Vec::new();
  fs::create_dir_all(dst)?;

  let walker = WalkDir::new(src).sort_by_file_name().into_iter().filter_entry(|e| {
    e.depth() == 0
      || e
        .file_name()
        .to_str()
        .map(|name| !exclude.contains(&name))
        .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    if rel.as_os_str().is_empty() {
      continue;
    }
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target)?;
    } else if file_type.is_symlink() {
      copy_symlink(entry.path(), &target)?;
      written.push(target);
    } else if file_type.is_file() {
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
      }
      fs::copy(entry.path(), &target)?;
      written.push(target);
    }
  }

  Ok(written)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
  let link_target = fs::read_link(src)?;
  if dst.symlink_metadata().is_ok() {
    fs::remove_file(dst)?;
  }
  std::os::unix::fs::symlink(link_target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
  fs::copy(src, dst).map(|_| ())
}

/// Remove a directory if it exists; missing directories are not an error.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
  match fs::remove_dir_all(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn copies_nested_files_and_skips_excluded() {
    let temp = tempdir().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(src.join("a/b")).unwrap();
    fs::create_dir_all(src.join(".git")).unwrap();
    fs::write(src.join("a/b/file.txt"), "nested").unwrap();
    fs::write(src.join("top.txt"), "top").unwrap();
    fs::write(src.join(".git/HEAD"), "ref: refs/heads/main").unwrap();

    let dst = temp.path().join("dst");
    let written = copy_tree(&src, &dst, &[".git"]).unwrap();

    assert_eq!(written.len(), 2);
    assert_eq!(fs::read_to_string(dst.join("a/b/file.txt")).unwrap(), "nested");
    assert!(dst.join("top.txt").exists());
    assert!(!dst.join(".git").exists());
  }

  #[test]
  fn contained_relative_rejects_escapes() {
    assert_eq!(contained_relative("embedded/lib"), Some(PathBuf::from("embedded/lib")));
    assert_eq!(contained_relative("./embedded/./lib"), Some(PathBuf::from("embedded/lib")));
    assert_eq!(contained_relative("."), Some(PathBuf::new()));
    assert_eq!(contained_relative("../etc"), None);
    assert_eq!(contained_relative("embedded/../lib"), None);
    assert_eq!(contained_relative("/etc/passwd"), None);
  }

  #[test]
  fn remove_missing_dir_is_ok() {
    let temp = tempdir().unwrap();
    remove_dir_if_exists(&temp.path().join("nope")).unwrap();
  }
}
