//! Git sources.
//!
//! Repositories are cloned once into `<git cache>/<name>-<url digest>` and
//! fetched incrementally afterwards. Two descriptors sharing a name but not a
//! URL never share a clone. The working directory handed to steps is an
//! export of the committed tree at the resolved revision, so two fetches of
//! the same revision produce byte-identical trees regardless of what the
//! cache checkout looks like.

use std::fs;
use std::path::{Path, PathBuf};

use gix::objs::tree::EntryKind;
use gix::remote::Direction;
use tracing::{debug, info};

use super::FetchError;
use crate::descriptor::VersionSpec;
use crate::util::fs::remove_dir_if_exists;
use crate::util::hash::hash_bytes;

const URL_DIGEST_LEN: usize = 12;

/// Fetch `url` into the clone cache and export `version` into `target`.
/// Returns the resolved commit id.
pub(super) fn fetch_git(
  name: &str,
  url: &str,
  version: &VersionSpec,
  cache_dir: &Path,
  target: &Path,
) -> Result<String, FetchError> {
  let repo_path = clone_dir(cache_dir, name, url);
  fs::create_dir_all(cache_dir).map_err(|e| FetchError::io(cache_dir, e))?;

  let (repo, fresh) = if repo_path.join(".git").exists() {
    debug!(name, path = %repo_path.display(), "opening cached clone");
    let repo = gix::open(&repo_path).map_err(|e| FetchError::unavailable(name, e))?;
    (repo, false)
  } else {
    // A half-written clone from an interrupted run is useless.
    remove_dir_if_exists(&repo_path).map_err(|e| FetchError::io(&repo_path, e))?;
    info!(name, url, path = %repo_path.display(), "cloning repository");
    (clone_repo(name, url, &repo_path)?, true)
  };

  let candidates = revision_candidates(version);
  let commit = if version.is_floating() && !fresh {
    fetch_updates(name, &repo)?;
    resolve_revision(&repo, &candidates)
  } else {
    match resolve_revision(&repo, &candidates) {
      Some(commit) => Some(commit),
      None if !fresh => {
        debug!(name, rev = %version, "revision not in cache, fetching");
        fetch_updates(name, &repo)?;
        resolve_revision(&repo, &candidates)
      }
      None => None,
    }
  };

  let commit = commit.ok_or_else(|| FetchError::RevisionNotFound {
    name: name.to_string(),
    rev: version.to_string(),
  })?;

  export_tree(name, &repo, &commit, target)?;
  debug!(name, rev = %commit, "exported tree");
  Ok(commit)
}

/// Clone location for `url`. Trailing slashes and `.git` suffixes do not
/// change the location.
fn clone_dir(cache_dir: &Path, name: &str, url: &str) -> PathBuf {
  let normalized = url.trim_end_matches('/');
  let normalized = normalized.strip_suffix(".git").unwrap_or(normalized);
  let digest = hash_bytes(normalized.as_bytes());
  cache_dir.join(format!("{}-{}", name, &digest.0[..URL_DIGEST_LEN]))
}

fn clone_repo(name: &str, url: &str, dest: &Path) -> Result<gix::Repository, FetchError> {
  let mut prepared = gix::prepare_clone(url, dest).map_err(|e| FetchError::unavailable(name, e))?;

  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| FetchError::unavailable(name, e))?;

  let (repo, _outcome) = checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| FetchError::unavailable(name, e))?;

  Ok(repo)
}

fn fetch_updates(name: &str, repo: &gix::Repository) -> Result<(), FetchError> {
  debug!(name, "fetching updates");

  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or_else(|| FetchError::unavailable(name, "no remote configured in cached clone"))?
    .map_err(|e| FetchError::unavailable(name, e))?;

  remote
    .connect(Direction::Fetch)
    .map_err(|e| FetchError::unavailable(name, e))?
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| FetchError::unavailable(name, e))?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| FetchError::unavailable(name, e))?;

  Ok(())
}

/// Revision specs to try, most specific first. Floating branch names
/// prefer the remote-tracking ref so fetched updates are seen.
fn revision_candidates(version: &VersionSpec) -> Vec<String> {
  match version {
    VersionSpec::Floating(marker) if marker == "HEAD" || marker == "latest" => {
      vec!["refs/remotes/origin/HEAD".to_string(), "HEAD".to_string()]
    }
    VersionSpec::Floating(branch) => vec![format!("refs/remotes/origin/{}", branch), branch.clone()],
    VersionSpec::Pinned(rev) => vec![
      format!("refs/tags/{}", rev),
      rev.clone(),
      format!("refs/remotes/origin/{}", rev),
    ],
  }
}

fn resolve_revision(repo: &gix::Repository, candidates: &[String]) -> Option<String> {
  candidates.iter().find_map(|spec| {
    let id = repo.rev_parse_single(spec.as_str()).ok()?;
    let commit = id.object().ok()?.peel_to_commit().ok()?;
    Some(commit.id.to_string())
  })
}

/// Write the tree of `commit` into `target`, replacing its contents.
fn export_tree(name: &str, repo: &gix::Repository, commit: &str, target: &Path) -> Result<(), FetchError> {
  let not_found = || FetchError::RevisionNotFound {
    name: name.to_string(),
    rev: commit.to_string(),
  };

  let tree = repo
    .rev_parse_single(commit)
    .map_err(|_| not_found())?
    .object()
    .map_err(|_| not_found())?
    .peel_to_commit()
    .map_err(|_| not_found())?
    .tree()
    .map_err(|e| FetchError::unavailable(name, e))?;

  let mut recorder = gix::traverse::tree::Recorder::default();
  tree
    .traverse()
    .breadthfirst(&mut recorder)
    .map_err(|e| FetchError::unavailable(name, e))?;

  remove_dir_if_exists(target).map_err(|e| FetchError::io(target, e))?;
  fs::create_dir_all(target).map_err(|e| FetchError::io(target, e))?;

  for entry in recorder.records {
    let rel = std::str::from_utf8(&entry.filepath)
      .map_err(|e| FetchError::unavailable(name, format!("non UTF-8 path in tree: {}", e)))?;
    let path = target.join(rel);

    match entry.mode.kind() {
      EntryKind::Tree => {
        fs::create_dir_all(&path).map_err(|e| FetchError::io(&path, e))?;
      }
      // Submodules are not part of the exported tree.
      EntryKind::Commit => {}
      kind => {
        let object = repo
          .find_object(entry.oid)
          .map_err(|e| FetchError::unavailable(name, e))?;
        if let Some(parent) = path.parent() {
          fs::create_dir_all(parent).map_err(|e| FetchError::io(parent, e))?;
        }
        write_entry(&path, &object.data, kind)?;
      }
    }
  }

  Ok(())
}

#[cfg(unix)]
fn write_entry(path: &Path, data: &[u8], kind: EntryKind) -> Result<(), FetchError> {
  use std::os::unix::ffi::OsStrExt;
  use std::os::unix::fs::PermissionsExt;

  if kind == EntryKind::Link {
    let link_target = std::ffi::OsStr::from_bytes(data);
    return std::os::unix::fs::symlink(link_target, path).map_err(|e| FetchError::io(path, e));
  }
  fs::write(path, data).map_err(|e| FetchError::io(path, e))?;
  if kind == EntryKind::BlobExecutable {
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| FetchError::io(path, e))?;
  }
  Ok(())
}

#[cfg(not(unix))]
fn write_entry(path: &Path, data: &[u8], _kind: EntryKind) -> Result<(), FetchError> {
  // Symlinks are written as plain files holding the link target.
  fs::write(path, data).map_err(|e| FetchError::io(path, e))
}
