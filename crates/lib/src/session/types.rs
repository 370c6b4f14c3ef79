use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::fetch::FetchError;
use crate::install::{InstallError, InstallRecord};
use crate::platform::Platform;
use crate::platform::paths::{build_cache_dir, cache_dir, git_cache_dir};
use crate::predicate::PredicateError;
use crate::resolve::ResolveError;
use crate::step::{StepError, StepReport};

/// What happens to the rest of the session after a descriptor fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
  /// Start no further descriptors.
  #[default]
  Halt,
  /// Keep building descriptors that do not depend on the failure.
  Continue,
}

/// Configuration for a build session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
  /// Maximum descriptors building at once.
  pub parallelism: usize,
  /// Shell override for command steps.
  pub shell: Option<String>,
  /// Extra fetch attempts after a transient failure.
  pub fetch_retries: u32,
  /// Linear backoff unit between fetch attempts.
  pub fetch_backoff: Duration,
  pub failure_policy: FailurePolicy,
  /// Reuse stored results for pinned descriptors.
  pub cache_builds: bool,
  /// Install root; overrides the project's `install_dir`.
  pub install_dir: Option<PathBuf>,
  /// Fetched sources, install record and default install root live here.
  pub work_dir: PathBuf,
  pub git_cache_dir: PathBuf,
  pub build_cache_dir: PathBuf,
  /// Target platform; detected from the host when `None`.
  pub platform: Option<Platform>,
  /// Additional facts available to step conditions.
  pub extra_facts: BTreeMap<String, bool>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
      shell: None,
      fetch_retries: 2,
      fetch_backoff: Duration::from_millis(500),
      failure_policy: FailurePolicy::Halt,
      cache_builds: true,
      install_dir: None,
      work_dir: cache_dir().join("work"),
      git_cache_dir: git_cache_dir(),
      build_cache_dir: build_cache_dir(),
      platform: None,
      extra_facts: BTreeMap::new(),
    }
  }
}

impl SessionConfig {
  /// Defaults with every directory placed under `root`. Used by tests and
  /// by callers that want a self-contained session.
  pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    Self {
      work_dir: root.join("work"),
      git_cache_dir: root.join("cache/git"),
      build_cache_dir: root.join("cache/builds"),
      ..Self::default()
    }
  }
}

#[derive(Debug, Error)]
pub enum SessionError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error("descriptor '{descriptor}' step {step_index}: {source}")]
  Predicate {
    descriptor: String,
    step_index: usize,
    #[source]
    source: PredicateError,
  },

  #[error("cannot detect the target platform; set it explicitly")]
  UnknownPlatform,

  #[error("fetching '{descriptor}' failed: {source}")]
  Fetch {
    descriptor: String,
    #[source]
    source: FetchError,
  },

  #[error(transparent)]
  Step(#[from] StepError),

  #[error(transparent)]
  Install(#[from] InstallError),

  #[error("I/O error at {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("build task for '{descriptor}' failed: {message}")]
  Task { descriptor: String, message: String },

  #[error("session cancelled")]
  Cancelled,
}

impl SessionError {
  /// Errors detected before any fetch or subprocess ran.
  pub fn is_configuration(&self) -> bool {
    matches!(self, Self::Resolve(_) | Self::Predicate { .. } | Self::UnknownPlatform)
  }

  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Fetch { source, .. } => source.is_retryable(),
      _ => false,
    }
  }

  /// The descriptor the error belongs to, when there is one.
  pub fn descriptor(&self) -> Option<&str> {
    match self {
      Self::Predicate { descriptor, .. } | Self::Fetch { descriptor, .. } | Self::Task { descriptor, .. } => {
        Some(descriptor)
      }
      Self::Step(e) => Some(e.descriptor()),
      Self::Install(InstallError::UnsafePath { descriptor, .. } | InstallError::Conflict { descriptor, .. }) => {
        Some(descriptor)
      }
      _ => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    match self {
      Self::Cancelled => true,
      Self::Step(e) => e.is_cancelled(),
      Self::Fetch { source, .. } => matches!(source, FetchError::Cancelled),
      _ => false,
    }
  }
}

/// Outcome of a session that passed configuration checks.
#[derive(Debug, Serialize)]
pub struct SessionReport {
  /// Descriptors in resolved order.
  pub order: Vec<String>,
  /// Built by running their steps.
  pub built: Vec<String>,
  /// Restored from the build cache.
  pub cached: Vec<String>,
  pub failed: Vec<String>,
  /// Not attempted because a dependency failed or was skipped.
  pub skipped: Vec<String>,
  /// Not attempted because the session halted or was cancelled.
  pub not_started: Vec<String>,
  pub steps: BTreeMap<String, StepReport>,
  pub install: InstallRecord,
  #[serde(skip)]
  pub errors: Vec<SessionError>,
  #[serde(skip)]
  pub duration: Duration,
  pub cancelled: bool,
}

impl SessionReport {
  /// Every descriptor was built or restored.
  pub fn success(&self) -> bool {
    self.errors.is_empty() && !self.cancelled && self.built.len() + self.cached.len() == self.order.len()
  }

  /// The first fatal error observed.
  pub fn first_error(&self) -> Option<&SessionError> {
    self.errors.first()
  }
}
