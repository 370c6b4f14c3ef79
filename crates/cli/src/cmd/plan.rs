//! Implementation of the `kiln plan` command.
//!
//! Runs the configuration phase of a build: loads the project, resolves the
//! dependency graph and checks every step condition, then prints the order
//! descriptors would build in. Nothing is fetched or executed.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use kiln_lib::session::{Session, SessionConfig};

use super::target::TargetArgs;
use crate::output::{OutputFormat, print_error, print_json, print_stat, print_success, symbols};

#[derive(Args, Debug)]
pub struct PlanArgs {
  /// Project file, or a directory containing project.lua
  #[arg(default_value = ".")]
  pub project: PathBuf,

  #[command(flatten)]
  pub target: TargetArgs,

  /// Show each descriptor's version, source and step count
  #[arg(long)]
  pub details: bool,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

#[derive(Debug, Serialize)]
struct PlanOutput {
  project: String,
  platform: String,
  order: Vec<String>,
  waves: Vec<Vec<String>>,
  descriptors: Vec<PlannedDescriptor>,
}

#[derive(Debug, Serialize)]
struct PlannedDescriptor {
  name: String,
  version: String,
  source: String,
  dependencies: Vec<String>,
  steps: usize,
}

pub fn cmd_plan(args: PlanArgs) -> Result<()> {
  let loaded = args.target.load(&args.project)?;
  let project_name = loaded.project.name.clone();

  let mut config = SessionConfig::default();
  args.target.apply(&mut config);
  let session = Session::new(loaded.project, loaded.registry.clone(), config);

  let plan = match session.plan() {
    Ok(plan) => plan,
    Err(e) => {
      print_error(&format!("Configuration error: {}", e));
      std::process::exit(1);
    }
  };

  let descriptors: Vec<PlannedDescriptor> = plan
    .order()
    .into_iter()
    .filter_map(|name| loaded.registry.get(&name))
    .map(|d| PlannedDescriptor {
      name: d.name().to_string(),
      version: d.version().to_string(),
      source: match d.source().location.as_str() {
        "" => d.source().kind.to_string(),
        location => format!("{} {}", d.source().kind, location),
      },
      dependencies: plan.graph.dependencies(d.name()),
      steps: d.steps().len(),
    })
    .collect();

  let output = PlanOutput {
    project: project_name,
    platform: plan.platform.to_string(),
    order: plan.order(),
    waves: plan.waves(),
    descriptors,
  };

  if args.output.is_json() {
    return print_json(&output);
  }

  print_success(&format!("Plan for {} on {}", output.project, output.platform));
  print_stat("Descriptors", &output.order.len().to_string());
  print_stat("Waves", &output.waves.len().to_string());
  println!();

  for (index, wave) in output.waves.iter().enumerate() {
    println!("Wave {}:", index + 1);
    for name in wave {
      println!("  {} {}", symbols::ARROW, name);
      if !args.details {
        continue;
      }
      if let Some(d) = output.descriptors.iter().find(|d| &d.name == name) {
        println!("      version: {}", d.version);
        println!("      source:  {}", d.source);
        println!("      steps:   {}", d.steps);
        if !d.dependencies.is_empty() {
          println!("      after:   {}", d.dependencies.join(", "));
        }
      }
    }
  }

  Ok(())
}
