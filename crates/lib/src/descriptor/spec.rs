//! Serde form of descriptor and project files.
//!
//! These mirror what a software file returns and are converted into the
//! validated types with `TryFrom`.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::types::{BuildStep, DescriptorError, SoftwareDescriptor, SourceRef};
use crate::predicate::{self, Predicate};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoftwareSpec {
  pub name: String,
  #[serde(default, alias = "version")]
  pub default_version: Option<String>,
  #[serde(default)]
  pub source: Option<SourceSpec>,
  #[serde(default)]
  pub relative_path: Option<String>,
  #[serde(default)]
  pub license: Option<LicenseSpec>,
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(default)]
  pub build: Vec<StepSpec>,
}

/// Exactly one of `git`, `path`, `url` may be set; none means no source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSpec {
  #[serde(default)]
  pub git: Option<String>,
  #[serde(default)]
  pub path: Option<String>,
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub sha256: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LicenseSpec {
  pub name: String,
  #[serde(default)]
  pub file: Option<String>,
}

/// A step, or a group of steps sharing a condition.
///
/// ```lua
/// { command = "make", when = "linux_target", cwd = "build", env = { CC = "clang" } }
/// { copy = "out/lib.so", to = "embedded/lib" }
/// { when = "osx_target", steps = { ... } }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
  #[serde(default)]
  pub command: Option<String>,
  #[serde(default)]
  pub copy: Option<String>,
  #[serde(default)]
  pub to: Option<String>,
  #[serde(default)]
  pub when: Option<String>,
  #[serde(default)]
  pub cwd: Option<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub steps: Option<Vec<StepSpec>>,
}

/// What a project file returns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSpec {
  pub name: String,
  #[serde(default)]
  pub dependencies: Vec<String>,
  #[serde(default)]
  pub install_dir: Option<String>,
  #[serde(default)]
  pub software_dirs: Option<Vec<String>>,
  #[serde(default)]
  pub software: Vec<SoftwareSpec>,
}

impl TryFrom<SoftwareSpec> for SoftwareDescriptor {
  type Error = DescriptorError;

  fn try_from(spec: SoftwareSpec) -> Result<Self, Self::Error> {
    let name = spec.name.clone();
    let mut builder = SoftwareDescriptor::builder(&spec.name);

    if let Some(version) = &spec.default_version {
      builder = builder.version(version);
    }
    if let Some(source) = spec.source {
      builder = builder.source(source.into_source_ref(&name)?);
    }
    if let Some(rel) = spec.relative_path {
      builder = builder.relative_path(rel);
    }
    if let Some(license) = spec.license {
      builder = builder.license(license.name, license.file.as_deref());
    }
    for dep in spec.dependencies {
      builder = builder.dependency(dep);
    }

    let mut steps = Vec::new();
    flatten_steps(&name, spec.build, None, &mut steps)?;
    builder.steps(steps).build()
  }
}

impl SourceSpec {
  fn into_source_ref(self, name: &str) -> Result<SourceRef, DescriptorError> {
    match (self.git, self.path, self.url) {
      (Some(git), None, None) => Ok(SourceRef::git(git)),
      (None, Some(path), None) => Ok(SourceRef::local(path)),
      (None, None, Some(url)) => Ok(SourceRef::url(url, self.sha256.unwrap_or_default())),
      (None, None, None) => Ok(SourceRef::none()),
      _ => Err(DescriptorError::new(name, "source must set exactly one of git, path, url")),
    }
  }
}

/// Flatten nested step groups, AND-ing each group's condition onto its children.
fn flatten_steps(
  name: &str,
  specs: Vec<StepSpec>,
  inherited: Option<&Predicate>,
  out: &mut Vec<BuildStep>,
) -> Result<(), DescriptorError> {
  for spec in specs {
    let condition = match &spec.when {
      Some(expr) => {
        let parsed = predicate::parse(expr).map_err(|e| DescriptorError::new(name, e.to_string()))?;
        Some(match inherited {
          Some(parent) => parent.clone().and(parsed),
          None => parsed,
        })
      }
      None => inherited.cloned(),
    };

    if let Some(children) = spec.steps {
      if spec.command.is_some() || spec.copy.is_some() || spec.cwd.is_some() || !spec.env.is_empty() {
        return Err(DescriptorError::new(
          name,
          "a step group only takes 'when' and 'steps'",
        ));
      }
      flatten_steps(name, children, condition.as_ref(), out)?;
      continue;
    }

    let mut step = match (spec.command, spec.copy, spec.to) {
      (Some(command), None, None) => BuildStep::command(command),
      (None, Some(from), Some(to)) => BuildStep::copy(from, to),
      (None, Some(_), None) => return Err(DescriptorError::new(name, "copy step requires 'to'")),
      _ => {
        return Err(DescriptorError::new(
          name,
          "step must set either 'command' or 'copy' and 'to'",
        ));
      }
    };
    step.condition = condition;
    step.working_dir = spec.cwd;
    step.env = spec.env;
    out.push(step);
  }
  Ok(())
}
