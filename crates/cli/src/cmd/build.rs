//! Implementation of the `kiln build` command.
//!
//! Loads a project, builds every descriptor it depends on into the install
//! tree, and writes the version manifest next to the install record.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use kiln_lib::consts::VERSION_MANIFEST_FILE;
use kiln_lib::manifest::VersionManifest;
use kiln_lib::session::{FailurePolicy, Session, SessionConfig, SessionError, SessionReport};
use kiln_lib::step::StepError;

use super::target::TargetArgs;
use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_stat, print_success, print_warning,
  short_revision, symbols,
};

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// Project file, or a directory containing project.lua
  #[arg(default_value = ".")]
  pub project: PathBuf,

  #[command(flatten)]
  pub target: TargetArgs,

  /// Install root; overrides the project's install_dir
  #[arg(long)]
  pub install_dir: Option<PathBuf>,

  /// Directory for fetched sources and session records
  #[arg(long)]
  pub work_dir: Option<PathBuf>,

  /// Descriptors to build at once (defaults to the number of CPUs)
  #[arg(short, long)]
  pub jobs: Option<usize>,

  /// Extra attempts after a transient fetch failure
  #[arg(long, default_value_t = 2)]
  pub retries: u32,

  /// Wait between fetch attempts (e.g., "500ms", "2s"), growing linearly
  #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
  pub backoff: Duration,

  /// Keep building descriptors that do not depend on a failure
  #[arg(short, long)]
  pub keep_going: bool,

  /// Always run build steps, never restore from the build cache
  #[arg(long)]
  pub no_cache: bool,

  /// Shell used for command steps
  #[arg(long)]
  pub shell: Option<String>,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

impl BuildArgs {
  fn session_config(&self) -> SessionConfig {
    let mut config = SessionConfig::default();
    self.target.apply(&mut config);
    if let Some(jobs) = self.jobs {
      config.parallelism = jobs.max(1);
    }
    if let Some(dir) = &self.work_dir {
      config.work_dir = dir.clone();
    }
    config.install_dir = self.install_dir.clone();
    config.fetch_retries = self.retries;
    config.fetch_backoff = self.backoff;
    config.cache_builds = !self.no_cache;
    config.shell = self.shell.clone();
    if self.keep_going {
      config.failure_policy = FailurePolicy::Continue;
    }
    config
  }
}

#[derive(Debug, Serialize)]
struct BuildOutput<'a> {
  project: &'a str,
  success: bool,
  #[serde(flatten)]
  report: &'a SessionReport,
  manifest: PathBuf,
  errors: Vec<String>,
}

pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let loaded = args.target.load(&args.project)?;
  let project_name = loaded.project.name.clone();
  let config = args.session_config();
  let work_dir = config.work_dir.clone();

  let manifest = Arc::new(VersionManifest::new());
  let session = Session::new(loaded.project, loaded.registry, config).with_manifest(manifest.clone());

  if !args.output.is_json() {
    print_info(&format!("Building {} into {}", project_name, session.install_root().display()));
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt.block_on(async {
    let cancel = session.cancel_handle();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, stopping build");
        cancel.cancel();
      }
    });
    session.run().await
  });

  let report = match result {
    Ok(report) => report,
    Err(e) => {
      print_error(&format!("Configuration error: {}", e));
      std::process::exit(1);
    }
  };

  let manifest_path = work_dir.join(VERSION_MANIFEST_FILE);
  manifest
    .write(&manifest_path)
    .with_context(|| format!("Failed to write version manifest: {}", manifest_path.display()))?;
  info!(path = %manifest_path.display(), entries = manifest.len(), "version manifest written");

  if args.output.is_json() {
    print_json(&BuildOutput {
      project: &project_name,
      success: report.success(),
      report: &report,
      manifest: manifest_path.clone(),
      errors: report.errors.iter().map(|e| e.to_string()).collect(),
    })?;
  } else {
    print_summary(&report, &manifest, &manifest_path);
  }

  if !report.success() {
    if let Some(err) = report.first_error() {
      print_error(&describe_failure(err));
    } else if report.cancelled {
      print_warning("Build cancelled");
    }
    std::process::exit(1);
  }

  Ok(())
}

fn print_summary(report: &SessionReport, manifest: &VersionManifest, manifest_path: &std::path::Path) {
  println!();
  for name in &report.order {
    let line = match manifest.get(name) {
      Some(entry) => match &entry.source_revision {
        Some(rev) => format!("{} {} ({})", name, entry.version, short_revision(rev)),
        None => format!("{} {}", name, entry.version),
      },
      None => name.clone(),
    };
    if report.cached.contains(name) {
      println!("  {} {} (cached)", symbols::SUCCESS, line);
    } else if report.built.contains(name) {
      println!("  {} {}", symbols::SUCCESS, line);
    } else if report.failed.contains(name) {
      println!("  {} {}", symbols::ERROR, line);
    } else {
      println!("  {} {}", symbols::SKIP, line);
    }
  }
  println!();

  if report.success() {
    print_success(&format!("Build complete in {}", format_duration(report.duration)));
  }
  print_stat("Built", &report.built.len().to_string());
  print_stat("Cached", &report.cached.len().to_string());
  if !report.failed.is_empty() {
    print_stat("Failed", &report.failed.join(", "));
  }
  if !report.skipped.is_empty() {
    print_stat("Skipped", &report.skipped.join(", "));
  }
  if !report.not_started.is_empty() {
    print_stat("Not started", &report.not_started.join(", "));
  }
  print_stat("Install root", &report.install.root.display().to_string());
  print_stat("Manifest", &manifest_path.display().to_string());
}

/// One line naming the descriptor, step and exit status of a failure.
fn describe_failure(err: &SessionError) -> String {
  match err {
    SessionError::Step(StepError::StepExecution {
      descriptor,
      step_index,
      exit_status,
      command,
    }) => format!(
      "Build failed: {} step {} failed with {} ({})",
      descriptor, step_index, exit_status, command
    ),
    other => match other.descriptor() {
      Some(name) if !other.to_string().contains(name) => format!("Build failed: {}: {}", name, other),
      _ => format!("Build failed: {}", other),
    },
  }
}
