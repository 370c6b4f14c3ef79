//! Build step execution.
//!
//! [`run`] walks a descriptor's steps in declared order. Each step's
//! condition is evaluated against the session's facts; unmet conditions
//! skip the step with no side effects. Commands run through the shell with
//! the step variables exported; copy steps write through the install tree.
//! Commands that reference `install_dir` run with their writes tracked and
//! attributed to the descriptor.
//! The first failing step stops the descriptor.

pub mod cmd;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::cancel::CancelToken;
use crate::descriptor::{BuildStep, SoftwareDescriptor, StepAction};
use crate::install::{InstallError, InstallTree};
use crate::placeholder::{PlaceholderError, StepVars, mentions_install_dir, substitute};
use crate::predicate::{FactSet, PredicateError};

use cmd::{CmdOutcome, execute_cmd};

#[derive(Debug, Error)]
pub enum StepError {
  #[error("step {step_index} of '{descriptor}' failed with {exit_status}: {command}")]
  StepExecution {
    descriptor: String,
    step_index: usize,
    exit_status: ExitStatus,
    command: String,
  },

  #[error("step {step_index} of '{descriptor}' could not start: {source}")]
  Spawn {
    descriptor: String,
    step_index: usize,
    #[source]
    source: std::io::Error,
  },

  #[error("step {step_index} of '{descriptor}' has a bad condition: {source}")]
  Condition {
    descriptor: String,
    step_index: usize,
    #[source]
    source: PredicateError,
  },

  #[error("step {step_index} of '{descriptor}': {source}")]
  Placeholder {
    descriptor: String,
    step_index: usize,
    #[source]
    source: PlaceholderError,
  },

  #[error("step {step_index} of '{descriptor}' has no working directory at {}", .path.display())]
  WorkingDir {
    descriptor: String,
    step_index: usize,
    path: PathBuf,
  },

  #[error("step {step_index} of '{descriptor}': {source}")]
  Install {
    descriptor: String,
    step_index: usize,
    #[source]
    source: InstallError,
  },

  #[error("step {step_index} of '{descriptor}' cancelled")]
  Cancelled { descriptor: String, step_index: usize },
}

impl StepError {
  pub fn descriptor(&self) -> &str {
    match self {
      Self::StepExecution { descriptor, .. }
      | Self::Spawn { descriptor, .. }
      | Self::Condition { descriptor, .. }
      | Self::Placeholder { descriptor, .. }
      | Self::WorkingDir { descriptor, .. }
      | Self::Install { descriptor, .. }
      | Self::Cancelled { descriptor, .. } => descriptor,
    }
  }

  pub fn step_index(&self) -> usize {
    match self {
      Self::StepExecution { step_index, .. }
      | Self::Spawn { step_index, .. }
      | Self::Condition { step_index, .. }
      | Self::Placeholder { step_index, .. }
      | Self::WorkingDir { step_index, .. }
      | Self::Install { step_index, .. }
      | Self::Cancelled { step_index, .. } => *step_index,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled { .. })
  }
}

/// Exit status of a failed command; `None` means killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitStatus(pub Option<i32>);

impl ExitStatus {
  pub fn code(&self) -> Option<i32> {
    self.0
  }
}

impl fmt::Display for ExitStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      Some(code) => write!(f, "exit status {}", code),
      None => f.write_str("termination by signal"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
  Ran,
  Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
  pub index: usize,
  pub description: String,
  pub outcome: StepOutcome,
  #[serde(with = "duration_ms")]
  pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepReport {
  pub descriptor: String,
  pub steps: Vec<StepRecord>,
}

impl StepReport {
  pub fn ran(&self) -> usize {
    self.steps.iter().filter(|s| s.outcome == StepOutcome::Ran).count()
  }

  pub fn skipped(&self) -> usize {
    self.steps.iter().filter(|s| s.outcome == StepOutcome::Skipped).count()
  }
}

/// Session-wide inputs to step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub project_dir: PathBuf,
  pub shell: Option<String>,
  pub cancel: CancelToken,
}

/// Run every step of `descriptor` against the fetched tree at `source_dir`.
pub async fn run(
  descriptor: &SoftwareDescriptor,
  source_dir: &Path,
  facts: &FactSet,
  install: &InstallTree,
  ctx: &StepContext,
) -> Result<StepReport, StepError> {
  let name = descriptor.name();
  let vars = StepVars {
    install_dir: install.root().display().to_string(),
    project_dir: ctx.project_dir.display().to_string(),
    source_dir: source_dir.display().to_string(),
    name: name.to_string(),
    version: descriptor.version().to_string(),
  };

  let mut report = StepReport {
    descriptor: name.to_string(),
    steps: Vec::with_capacity(descriptor.steps().len()),
  };

  for (index, step) in descriptor.steps().iter().enumerate() {
    if ctx.cancel.is_cancelled() {
      return Err(StepError::Cancelled {
        descriptor: name.to_string(),
        step_index: index,
      });
    }

    let description = step.describe();
    let enabled = match &step.condition {
      Some(condition) => condition.evaluate(facts).map_err(|source| StepError::Condition {
        descriptor: name.to_string(),
        step_index: index,
        source,
      })?,
      None => true,
    };

    if !enabled {
      info!(descriptor = name, step = index, "step skipped, condition not met");
      report.steps.push(StepRecord {
        index,
        description,
        outcome: StepOutcome::Skipped,
        duration: Duration::ZERO,
      });
      continue;
    }

    let start = Instant::now();
    info!(descriptor = name, step = index, action = %description, "running step");
    run_step(descriptor, index, step, source_dir, &vars, install, ctx).await?;

    report.steps.push(StepRecord {
      index,
      description,
      outcome: StepOutcome::Ran,
      duration: start.elapsed(),
    });
  }

  Ok(report)
}

async fn run_step(
  descriptor: &SoftwareDescriptor,
  index: usize,
  step: &BuildStep,
  source_dir: &Path,
  vars: &StepVars,
  install: &InstallTree,
  ctx: &StepContext,
) -> Result<(), StepError> {
  let name = descriptor.name();
  let placeholder_err = |source| StepError::Placeholder {
    descriptor: name.to_string(),
    step_index: index,
    source,
  };

  let cwd = match &step.working_dir {
    Some(dir) => source_dir.join(dir),
    None => descriptor.build_dir(source_dir),
  };
  if !cwd.is_dir() {
    return Err(StepError::WorkingDir {
      descriptor: name.to_string(),
      step_index: index,
      path: cwd,
    });
  }

  match &step.action {
    StepAction::Command { command } => {
      let writes_install = mentions_install_dir(command) || step.env.values().any(|v| mentions_install_dir(v));
      let command = substitute(command, vars).map_err(placeholder_err)?;

      let mut env: Vec<(String, String)> = vars.env().iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
      for (key, value) in &step.env {
        env.push((key.clone(), substitute(value, vars).map_err(placeholder_err)?));
      }

      let run = execute_cmd(&command, &env, &cwd, ctx.shell.as_deref(), &ctx.cancel);
      let outcome = if writes_install {
        let (outcome, _) = install.track_writes(name, run).await.map_err(|source| StepError::Install {
          descriptor: name.to_string(),
          step_index: index,
          source,
        })?;
        outcome
      } else {
        run.await
      };
      let outcome = outcome.map_err(|source| StepError::Spawn {
        descriptor: name.to_string(),
        step_index: index,
        source,
      })?;

      match outcome {
        CmdOutcome::Exited { code: Some(0), .. } => Ok(()),
        CmdOutcome::Exited { code, stderr, .. } => {
          let exit_status = ExitStatus(code);
          error!(descriptor = name, step = index, status = %exit_status, stderr = %stderr, "step failed");
          Err(StepError::StepExecution {
            descriptor: name.to_string(),
            step_index: index,
            exit_status,
            command,
          })
        }
        CmdOutcome::Cancelled => Err(StepError::Cancelled {
          descriptor: name.to_string(),
          step_index: index,
        }),
      }
    }
    StepAction::Copy { from, to } => {
      let from = substitute(from, vars).map_err(placeholder_err)?;
      let to = substitute(to, vars).map_err(placeholder_err)?;
      let to = install_relative(&to, install.root());

      install
        .copy_into(name, &cwd.join(&from), &to)
        .await
        .map_err(|source| StepError::Install {
          descriptor: name.to_string(),
          step_index: index,
          source,
        })?;
      Ok(())
    }
  }
}

/// Copy destinations written as `$${install_dir}/...` arrive absolute after
/// substitution; strip the root so the install tree sees a relative path.
/// Anything else absolute is left for the install tree to reject.
fn install_relative(dest: &str, root: &Path) -> String {
  let root = root.display().to_string();
  match dest.strip_prefix(&root) {
    Some(rest) if rest.is_empty() || rest.starts_with(['/', '\\']) => {
      let rest = rest.trim_start_matches(['/', '\\']);
      if rest.is_empty() { ".".to_string() } else { rest.to_string() }
    }
    _ => dest.to_string(),
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
  }
}
