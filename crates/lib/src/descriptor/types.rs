use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::FLOATING_VERSIONS;
use crate::predicate::Predicate;
use crate::util::fs::contained_relative;

/// Raised when a descriptor fails validation at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid descriptor '{name}': {reason}")]
pub struct DescriptorError {
  pub name: String,
  pub reason: String,
}

impl DescriptorError {
  pub fn new(name: &str, reason: impl Into<String>) -> Self {
    Self {
      name: name.to_string(),
      reason: reason.into(),
    }
  }
}

/// The version a descriptor builds.
///
/// Floating versions (`main`, `master`, `HEAD`, `latest`) always re-fetch and
/// never use the build cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionSpec {
  Pinned(String),
  Floating(String),
}

impl VersionSpec {
  pub fn parse(version: &str) -> Self {
    if FLOATING_VERSIONS.contains(&version) {
      Self::Floating(version.to_string())
    } else {
      Self::Pinned(version.to_string())
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      Self::Pinned(v) | Self::Floating(v) => v,
    }
  }

  pub fn is_floating(&self) -> bool {
    matches!(self, Self::Floating(_))
  }
}

impl fmt::Display for VersionSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl Serialize for VersionSpec {
  fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for VersionSpec {
  fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    Ok(Self::parse(&String::deserialize(deserializer)?))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
  Git,
  Local,
  Url,
  None,
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Git => "git",
      Self::Local => "local",
      Self::Url => "url",
      Self::None => "none",
    })
  }
}

/// Where a descriptor's source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
  pub kind: SourceKind,
  pub location: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sha256: Option<String>,
}

impl SourceRef {
  pub fn git(url: impl Into<String>) -> Self {
    Self {
      kind: SourceKind::Git,
      location: url.into(),
      sha256: None,
    }
  }

  pub fn local(path: impl Into<String>) -> Self {
    Self {
      kind: SourceKind::Local,
      location: path.into(),
      sha256: None,
    }
  }

  pub fn url(url: impl Into<String>, sha256: impl Into<String>) -> Self {
    Self {
      kind: SourceKind::Url,
      location: url.into(),
      sha256: Some(sha256.into()),
    }
  }

  pub fn none() -> Self {
    Self {
      kind: SourceKind::None,
      location: String::new(),
      sha256: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct License {
  pub name: String,
  pub file_path: Option<String>,
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
  /// Run a shell command.
  Command { command: String },
  /// Copy `from` (relative to the step's working directory) to `to`
  /// (relative to the install root) through the install tree.
  Copy { from: String, to: String },
}

/// One build step. Steps run strictly in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
  pub action: StepAction,
  /// Working directory relative to the fetched source root.
  pub working_dir: Option<String>,
  pub condition: Option<Predicate>,
  pub env: BTreeMap<String, String>,
}

impl BuildStep {
  pub fn command(command: impl Into<String>) -> Self {
    Self::from_action(StepAction::Command {
      command: command.into(),
    })
  }

  pub fn copy(from: impl Into<String>, to: impl Into<String>) -> Self {
    Self::from_action(StepAction::Copy {
      from: from.into(),
      to: to.into(),
    })
  }

  fn from_action(action: StepAction) -> Self {
    Self {
      action,
      working_dir: None,
      condition: None,
      env: BTreeMap::new(),
    }
  }

  /// Guard the step with a predicate. An existing guard is AND-ed.
  pub fn when(mut self, predicate: Predicate) -> Self {
    self.condition = Some(match self.condition.take() {
      Some(existing) => existing.and(predicate),
      None => predicate,
    });
    self
  }

  pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
    self.working_dir = Some(dir.into());
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  /// Short human-readable description for logs.
  pub fn describe(&self) -> String {
    match &self.action {
      StepAction::Command { command } => command.clone(),
      StepAction::Copy { from, to } => format!("copy {} -> {}", from, to),
    }
  }
}

/// A validated, immutable software descriptor.
///
/// Fields are private so nothing can alter steps or version after the
/// session's graph has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftwareDescriptor {
  name: String,
  version: VersionSpec,
  source: SourceRef,
  relative_path: Option<String>,
  license: License,
  dependencies: Vec<String>,
  steps: Vec<BuildStep>,
}

impl SoftwareDescriptor {
  pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
    DescriptorBuilder::new(name)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn version(&self) -> &VersionSpec {
    &self.version
  }

  pub fn source(&self) -> &SourceRef {
    &self.source
  }

  pub fn relative_path(&self) -> Option<&str> {
    self.relative_path.as_deref()
  }

  pub fn license(&self) -> &License {
    &self.license
  }

  pub fn dependencies(&self) -> &[String] {
    &self.dependencies
  }

  pub fn steps(&self) -> &[BuildStep] {
    &self.steps
  }

  /// Directory steps run in by default: `relative_path` under the source root.
  pub fn build_dir(&self, source_root: &Path) -> PathBuf {
    match &self.relative_path {
      Some(rel) => source_root.join(rel),
      None => source_root.to_path_buf(),
    }
  }

  /// Predicates guarding any step, for configuration-time validation.
  pub fn conditions(&self) -> impl Iterator<Item = &Predicate> {
    self.steps.iter().filter_map(|s| s.condition.as_ref())
  }
}

/// Builder for [`SoftwareDescriptor`]; validation happens in [`DescriptorBuilder::build`].
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
  name: String,
  version: VersionSpec,
  source: SourceRef,
  relative_path: Option<String>,
  license: License,
  dependencies: Vec<String>,
  steps: Vec<BuildStep>,
}

impl DescriptorBuilder {
  fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: VersionSpec::Floating("latest".to_string()),
      source: SourceRef::none(),
      relative_path: None,
      license: License::default(),
      dependencies: Vec::new(),
      steps: Vec::new(),
    }
  }

  pub fn version(mut self, version: &str) -> Self {
    self.version = VersionSpec::parse(version);
    self
  }

  pub fn source(mut self, source: SourceRef) -> Self {
    self.source = source;
    self
  }

  pub fn relative_path(mut self, path: impl Into<String>) -> Self {
    self.relative_path = Some(path.into());
    self
  }

  pub fn license(mut self, name: impl Into<String>, file_path: Option<&str>) -> Self {
    self.license = License {
      name: name.into(),
      file_path: file_path.map(str::to_string),
    };
    self
  }

  pub fn dependency(mut self, name: impl Into<String>) -> Self {
    self.dependencies.push(name.into());
    self
  }

  pub fn step(mut self, step: BuildStep) -> Self {
    self.steps.push(step);
    self
  }

  pub fn steps(mut self, steps: impl IntoIterator<Item = BuildStep>) -> Self {
    self.steps.extend(steps);
    self
  }

  pub fn build(self) -> Result<SoftwareDescriptor, DescriptorError> {
    let name = self.name.trim().to_string();
    if name.is_empty() {
      return Err(DescriptorError::new("", "name must not be empty"));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
      return Err(DescriptorError::new(&name, "name must not contain path separators"));
    }
    if self.version.as_str().is_empty() {
      return Err(DescriptorError::new(&name, "version must not be empty"));
    }

    match self.source.kind {
      SourceKind::Git | SourceKind::Local if self.source.location.is_empty() => {
        return Err(DescriptorError::new(&name, "source location must not be empty"));
      }
      SourceKind::Url => {
        if self.source.location.is_empty() {
          return Err(DescriptorError::new(&name, "source url must not be empty"));
        }
        match &self.source.sha256 {
          Some(sha) if sha.len() == 64 && sha.chars().all(|c| c.is_ascii_hexdigit()) => {}
          _ => return Err(DescriptorError::new(&name, "url sources require a 64-character sha256")),
        }
      }
      _ => {}
    }

    let relative_path = match self.relative_path {
      Some(rel) => Some(checked_relative(&name, "relative_path", &rel)?),
      None => None,
    };

    let mut steps = Vec::with_capacity(self.steps.len());
    for (index, mut step) in self.steps.into_iter().enumerate() {
      if let Some(dir) = step.working_dir.take() {
        step.working_dir = Some(checked_relative(&name, &format!("step {} working_dir", index), &dir)?);
      }
      match &step.action {
        StepAction::Command { command } if command.trim().is_empty() => {
          return Err(DescriptorError::new(&name, format!("step {} has an empty command", index)));
        }
        StepAction::Copy { from, to } => {
          if from.trim().is_empty() {
            return Err(DescriptorError::new(&name, format!("step {} copies from an empty path", index)));
          }
          // Destinations may carry placeholders; only literal escapes are
          // rejected here, the install tree re-checks after substitution.
          if !to.contains("$${") && contained_relative(to).is_none() {
            return Err(DescriptorError::new(
              &name,
              format!("step {} copies to '{}' outside the install tree", index, to),
            ));
          }
        }
        StepAction::Command { .. } => {}
      }
      steps.push(step);
    }

    let mut dependencies: Vec<String> = Vec::with_capacity(self.dependencies.len());
    for dep in self.dependencies {
      if dep == name {
        return Err(DescriptorError::new(&name, "descriptor depends on itself"));
      }
      if !dependencies.contains(&dep) {
        dependencies.push(dep);
      }
    }

    Ok(SoftwareDescriptor {
      name,
      version: self.version,
      source: self.source,
      relative_path,
      license: self.license,
      dependencies,
      steps,
    })
  }
}

fn checked_relative(name: &str, what: &str, path: &str) -> Result<String, DescriptorError> {
  match contained_relative(path) {
    Some(normalized) => Ok(normalized.to_string_lossy().replace('\\', "/")),
    None => Err(DescriptorError::new(
      name,
      format!("{} '{}' escapes the source tree", what, path),
    )),
  }
}

/// The root of a build: which descriptors to produce and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
  pub name: String,
  /// Declared dependencies. Order is the tie-break preference for the
  /// resolver; edges come from descriptor dependencies only.
  pub dependencies: Vec<String>,
  /// Directory the project was loaded from, exposed as `project_dir`.
  pub project_dir: PathBuf,
  /// Install root requested by the project, if any.
  pub install_dir: Option<PathBuf>,
}

impl Project {
  pub fn new(name: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
    Self {
      name: name.into(),
      dependencies: Vec::new(),
      project_dir: project_dir.into(),
      install_dir: None,
    }
  }

  pub fn dependency(mut self, name: impl Into<String>) -> Self {
    self.dependencies.push(name.into());
    self
  }

  pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.install_dir = Some(dir.into());
    self
  }
}
