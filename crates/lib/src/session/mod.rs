//! Build sessions.
//!
//! A [`Session`] takes a project and a descriptor registry through two
//! phases:
//!
//! 1. Configuration: resolve the dependency graph and validate every step
//!    condition against the fact set. Any error here is returned from
//!    [`Session::run`] before anything is fetched or executed.
//! 2. Build: execute the graph wave by wave. Descriptors within a wave run
//!    concurrently on a bounded pool; each one is fetched, then restored
//!    from the build cache or built, writing into the shared install tree.
//!
//! Build-time failures do not abort `run`; they are collected in the
//! [`SessionReport`]. Under [`FailurePolicy::Halt`] no descriptor starts
//! after the first failure; under [`FailurePolicy::Continue`] only the
//! dependents of a failed descriptor are skipped.

pub mod cache;
mod types;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::{CancelHandle, CancelToken};
use crate::consts::INSTALL_RECORD_FILE;
use crate::descriptor::{Project, Registry, SoftwareDescriptor};
use crate::fetch::{FetchOptions, FetchedSource, fetch};
use crate::install::InstallTree;
use crate::manifest::{ManifestEntry, ManifestSink, VersionManifest};
use crate::platform::Platform;
use crate::predicate::FactSet;
use crate::resolve::ExecutionGraph;
use crate::step::{self, StepContext, StepReport};
use crate::util::hash::Fingerprint;

use cache::{BuildCache, is_cacheable};

pub use types::{FailurePolicy, SessionConfig, SessionError, SessionReport};

/// Result of the configuration phase.
#[derive(Debug)]
pub struct Plan {
  pub graph: ExecutionGraph,
  pub facts: FactSet,
  pub platform: Platform,
}

impl Plan {
  pub fn order(&self) -> Vec<String> {
    self.graph.order()
  }

  pub fn waves(&self) -> Vec<Vec<String>> {
    self.graph.waves()
  }
}

pub struct Session {
  project: Project,
  registry: Arc<Registry>,
  config: SessionConfig,
  cancel: CancelHandle,
  manifest: Arc<dyn ManifestSink>,
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("project", &self.project.name)
      .field("descriptors", &self.registry.len())
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

/// How one descriptor finished.
enum Outcome {
  Built(StepReport),
  Cached,
  NotStarted,
}

/// State shared by every build task of a run.
struct Shared {
  registry: Arc<Registry>,
  facts: FactSet,
  install: InstallTree,
  cache: Option<BuildCache>,
  fetch_options: FetchOptions,
  step_ctx: StepContext,
  src_dir: PathBuf,
  manifest: Arc<dyn ManifestSink>,
  policy: FailurePolicy,
  halted: AtomicBool,
  cancel: CancelToken,
  /// Cache keys of descriptors finished in this session, folded into the
  /// keys of their dependents.
  keys: Mutex<HashMap<String, Fingerprint>>,
}

impl Shared {
  fn should_stop(&self) -> bool {
    self.halted.load(Ordering::SeqCst) || self.cancel.is_cancelled()
  }

  fn keys(&self) -> MutexGuard<'_, HashMap<String, Fingerprint>> {
    self.keys.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Cache key for `descriptor` built from `fetched`. `None` when caching is
  /// off or a direct dependency has no key.
  fn cache_key(&self, descriptor: &SoftwareDescriptor, fetched: &FetchedSource) -> Option<Fingerprint> {
    if self.cache.is_none() {
      return None;
    }
    let name = descriptor.name();

    let dependencies: BTreeMap<String, Fingerprint> = {
      let keys = self.keys();
      let mut dependencies = BTreeMap::new();
      for dep in descriptor.dependencies() {
        let Some(key) = keys.get(dep) else {
          debug!(descriptor = name, dependency = %dep, "dependency has no cache key");
          return None;
        };
        dependencies.insert(dep.clone(), key.clone());
      }
      dependencies
    };

    match BuildCache::key(
      descriptor,
      &self.facts,
      &fetched.content_hash,
      fetched.revision.as_deref(),
      &dependencies,
    ) {
      Ok(key) => {
        self.keys().insert(name.to_string(), key.clone());
        Some(key)
      }
      Err(e) => {
        warn!(descriptor = name, error = %e, "cannot compute cache key");
        None
      }
    }
  }
}

impl Session {
  pub fn new(project: Project, registry: Registry, config: SessionConfig) -> Self {
    Self {
      project,
      registry: Arc::new(registry),
      config,
      cancel: CancelHandle::new(),
      manifest: Arc::new(VersionManifest::new()),
    }
  }

  /// Report successful descriptors to `sink` instead of the default
  /// in-memory manifest.
  pub fn with_manifest(mut self, sink: Arc<dyn ManifestSink>) -> Self {
    self.manifest = sink;
    self
  }

  /// Handle that cancels this session's runs.
  pub fn cancel_handle(&self) -> CancelHandle {
    self.cancel.clone()
  }

  pub fn config(&self) -> &SessionConfig {
    &self.config
  }

  /// Target platform: configured, else the host.
  pub fn platform(&self) -> Result<Platform, SessionError> {
    self
      .config
      .platform
      .or_else(Platform::current)
      .ok_or(SessionError::UnknownPlatform)
  }

  pub fn facts(&self) -> Result<FactSet, SessionError> {
    let facts = self
      .config
      .extra_facts
      .iter()
      .fold(FactSet::for_platform(self.platform()?), |facts, (name, value)| {
        facts.with_fact(name.clone(), *value)
      });
    Ok(facts)
  }

  /// Install root: configured, else the project's (relative to the
  /// project dir), else `<work_dir>/install`.
  pub fn install_root(&self) -> PathBuf {
    match (&self.config.install_dir, &self.project.install_dir) {
      (Some(dir), _) => dir.clone(),
      (None, Some(dir)) => self.project.project_dir.join(dir),
      (None, None) => self.config.work_dir.join("install"),
    }
  }

  /// Run the configuration phase only.
  pub fn plan(&self) -> Result<Plan, SessionError> {
    let platform = self.platform()?;
    let facts = self.facts()?;
    let graph = ExecutionGraph::build(&self.project, &self.registry)?;

    for name in graph.order() {
      let Some(descriptor) = self.registry.get(&name) else {
        continue;
      };
      for (step_index, step) in descriptor.steps().iter().enumerate() {
        if let Some(condition) = &step.condition {
          condition.validate(&facts).map_err(|source| SessionError::Predicate {
            descriptor: name.clone(),
            step_index,
            source,
          })?;
        }
      }
    }

    debug!(project = %self.project.name, descriptors = graph.len(), platform = %platform, "configuration checked");
    Ok(Plan { graph, facts, platform })
  }

  /// Configure and build the project.
  ///
  /// Returns `Err` only for configuration errors; build-time failures are
  /// reported in the [`SessionReport`].
  pub async fn run(&self) -> Result<SessionReport, SessionError> {
    let start = Instant::now();
    let plan = self.plan()?;
    let order = plan.order();
    let waves = plan.waves();

    info!(
      project = %self.project.name,
      descriptors = order.len(),
      waves = waves.len(),
      platform = %plan.platform,
      "starting session"
    );

    let install = InstallTree::create(&self.install_root())?;
    let shared = Arc::new(Shared {
      registry: self.registry.clone(),
      facts: plan.facts.clone(),
      install,
      cache: self
        .config
        .cache_builds
        .then(|| BuildCache::new(&self.config.build_cache_dir)),
      fetch_options: FetchOptions {
        git_cache_dir: self.config.git_cache_dir.clone(),
        base_dir: self.project.project_dir.clone(),
        retries: self.config.fetch_retries,
        backoff: self.config.fetch_backoff,
      },
      step_ctx: StepContext {
        project_dir: self.project.project_dir.clone(),
        shell: self.config.shell.clone(),
        cancel: self.cancel.token(),
      },
      src_dir: self.config.work_dir.join("src"),
      manifest: self.manifest.clone(),
      policy: self.config.failure_policy,
      halted: AtomicBool::new(false),
      cancel: self.cancel.token(),
      keys: Mutex::new(HashMap::new()),
    });
    let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));

    let mut report = SessionReport {
      order: order.clone(),
      built: Vec::new(),
      cached: Vec::new(),
      failed: Vec::new(),
      skipped: Vec::new(),
      not_started: Vec::new(),
      steps: Default::default(),
      install: shared.install.record(),
      errors: Vec::new(),
      duration: Default::default(),
      cancelled: false,
    };
    let mut unavailable: HashSet<String> = HashSet::new();

    for (wave_idx, wave) in waves.into_iter().enumerate() {
      debug!(wave = wave_idx, descriptors = wave.len(), "executing wave");

      let mut ready = Vec::with_capacity(wave.len());
      for name in wave {
        if shared.should_stop() {
          unavailable.insert(name.clone());
          report.not_started.push(name);
          continue;
        }
        if let Some(dep) = plan.graph.dependencies(&name).into_iter().find(|d| unavailable.contains(d)) {
          warn!(descriptor = %name, dependency = %dep, "skipping, dependency did not build");
          unavailable.insert(name.clone());
          report.skipped.push(name);
          continue;
        }
        ready.push(name);
      }

      for (name, result) in execute_wave(ready, &shared, &semaphore).await {
        match result {
          Ok(Outcome::Built(steps)) => {
            report.built.push(name.clone());
            report.steps.insert(name, steps);
          }
          Ok(Outcome::Cached) => report.cached.push(name),
          Ok(Outcome::NotStarted) => {
            unavailable.insert(name.clone());
            report.not_started.push(name);
          }
          Err(e) => {
            if e.is_cancelled() {
              warn!(descriptor = %name, "descriptor cancelled");
            } else {
              error!(descriptor = %name, error = %e, "descriptor failed");
            }
            unavailable.insert(name.clone());
            report.failed.push(name);
            report.errors.push(e);
          }
        }
      }
    }

    for list in [
      &mut report.built,
      &mut report.cached,
      &mut report.failed,
      &mut report.skipped,
      &mut report.not_started,
    ] {
      list.sort_by_key(|name| order.iter().position(|n| n == name));
    }

    report.install = shared.install.record();
    let record_path = self.config.work_dir.join(INSTALL_RECORD_FILE);
    if let Err(e) = report.install.write(&record_path) {
      warn!(path = %record_path.display(), error = %e, "failed to write install record");
    }
    report.cancelled = self.cancel.is_cancelled();
    report.duration = start.elapsed();

    info!(
      built = report.built.len(),
      cached = report.cached.len(),
      failed = report.failed.len(),
      skipped = report.skipped.len(),
      not_started = report.not_started.len(),
      duration_ms = report.duration.as_millis() as u64,
      "session finished"
    );

    Ok(report)
  }
}

/// Build every descriptor in `names` concurrently, bounded by `semaphore`.
/// Results come back in completion order.
async fn execute_wave(
  names: Vec<String>,
  shared: &Arc<Shared>,
  semaphore: &Arc<Semaphore>,
) -> Vec<(String, Result<Outcome, SessionError>)> {
  let mut join_set = JoinSet::new();

  for name in names {
    let shared = shared.clone();
    let semaphore = semaphore.clone();
    join_set.spawn(async move {
      let result = match semaphore.acquire_owned().await {
        Ok(_permit) => build_descriptor(&name, &shared).await,
        Err(e) => Err(SessionError::Task {
          descriptor: name.clone(),
          message: e.to_string(),
        }),
      };
      (name, result)
    });
  }

  let mut results = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(result) => results.push(result),
      Err(e) => error!(error = %e, "build task panicked"),
    }
  }
  results
}

async fn build_descriptor(name: &str, shared: &Shared) -> Result<Outcome, SessionError> {
  // Checked after the permit is held so a failure elsewhere in the wave
  // stops descriptors still waiting for a slot.
  if shared.should_stop() {
    return Ok(Outcome::NotStarted);
  }

  let descriptor = shared.registry.get(name).ok_or_else(|| SessionError::Task {
    descriptor: name.to_string(),
    message: "descriptor missing from registry".to_string(),
  })?;

  shared.install.begin(name);
  let started = Instant::now();
  let result = build_or_restore(descriptor, shared).await;

  match &result {
    Ok(_) => {
      shared.install.mark_complete(name);
      info!(descriptor = name, elapsed_ms = started.elapsed().as_millis() as u64, "descriptor complete");
    }
    Err(_) => {
      shared.install.mark_incomplete(name);
      if shared.policy == FailurePolicy::Halt {
        shared.halted.store(true, Ordering::SeqCst);
      }
    }
  }
  result
}

async fn build_or_restore(descriptor: &SoftwareDescriptor, shared: &Shared) -> Result<Outcome, SessionError> {
  let name = descriptor.name();

  let target = shared.src_dir.join(name);
  let fetched = fetch(
    name,
    descriptor.source(),
    descriptor.version(),
    &target,
    &shared.fetch_options,
    &shared.cancel,
  )
  .await
  .map_err(|source| SessionError::Fetch {
    descriptor: name.to_string(),
    source,
  })?;

  let key = shared.cache_key(descriptor, &fetched).filter(|_| is_cacheable(descriptor));

  if let (Some(cache), Some(key)) = (&shared.cache, &key)
    && restore_from_cache(descriptor, cache, key, shared).await?
  {
    return Ok(Outcome::Cached);
  }

  let steps = step::run(descriptor, &fetched.dir, &shared.facts, &shared.install, &shared.step_ctx).await?;

  if let (Some(cache), Some(key)) = (&shared.cache, key) {
    let cache = cache.clone();
    let files = shared.install.contributed(name);
    let root = shared.install.root().to_path_buf();
    let revision = fetched.revision.clone();
    let owned_name = name.to_string();
    let stored = tokio::task::spawn_blocking(move || cache.store(&owned_name, &key, &root, &files, revision)).await;
    match stored {
      Ok(Ok(())) => debug!(descriptor = name, "build result cached"),
      Ok(Err(e)) => warn!(descriptor = name, error = %e, "failed to cache build result"),
      Err(e) => warn!(descriptor = name, error = %e, "cache task failed"),
    }
  }

  shared.manifest.record(manifest_entry(descriptor, fetched.revision));
  Ok(Outcome::Built(steps))
}

/// Restore a verified cache entry through the install tree. Returns whether
/// the descriptor was restored.
async fn restore_from_cache(
  descriptor: &SoftwareDescriptor,
  cache: &BuildCache,
  key: &Fingerprint,
  shared: &Shared,
) -> Result<bool, SessionError> {
  let name = descriptor.name();
  let lookup = {
    let cache = cache.clone();
    let key = key.clone();
    let name = name.to_string();
    tokio::task::spawn_blocking(move || cache.lookup(&name, &key)).await
  };
  let hit = match lookup {
    Ok(Some(hit)) => hit,
    Ok(None) => return Ok(false),
    Err(e) => {
      warn!(descriptor = name, error = %e, "cache lookup failed");
      return Ok(false);
    }
  };

  for file in &hit.files {
    let dest = relative_dest(file);
    shared
      .install
      .copy_into(name, &hit.files_dir.join(file), &dest)
      .await?;
  }

  info!(descriptor = name, files = hit.files.len(), "restored from build cache");
  shared.manifest.record(manifest_entry(descriptor, hit.revision));
  Ok(true)
}

fn relative_dest(path: &Path) -> String {
  path.to_string_lossy().replace('\\', "/")
}

fn manifest_entry(descriptor: &SoftwareDescriptor, revision: Option<String>) -> ManifestEntry {
  let license = &descriptor.license().name;
  ManifestEntry {
    source_revision: revision,
    license: (!license.is_empty()).then(|| license.clone()),
    ..ManifestEntry::new(descriptor.name(), descriptor.version().to_string())
  }
}

#[cfg(test)]
mod tests;
