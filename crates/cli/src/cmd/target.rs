//! Arguments shared by every command that evaluates a project.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use kiln_lib::lua::{LoadedProject, load_project_for};
use kiln_lib::platform::{Arch, Os, Platform};
use kiln_lib::predicate::FactSet;
use kiln_lib::session::SessionConfig;

#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
  /// Target operating system (linux, darwin, windows); defaults to the host
  #[arg(long, value_name = "OS")]
  pub target_os: Option<Os>,

  /// Target architecture (x86_64, aarch64); defaults to the host
  #[arg(long, value_name = "ARCH")]
  pub target_arch: Option<Arch>,

  /// Extra fact for step conditions, as NAME or NAME=true|false
  #[arg(long = "fact", value_name = "NAME[=BOOL]", value_parser = parse_fact)]
  pub facts: Vec<(String, bool)>,
}

impl TargetArgs {
  /// The target platform, filling unset parts from the host.
  pub fn platform(&self) -> Option<Platform> {
    let arch = self.target_arch.or_else(Arch::current)?;
    let os = self.target_os.or_else(Os::current)?;
    Some(Platform::new(arch, os))
  }

  pub fn apply(&self, config: &mut SessionConfig) {
    config.platform = self.platform();
    config.extra_facts.extend(self.facts.iter().cloned());
  }

  pub fn fact_set(&self) -> Result<FactSet> {
    let platform = self.platform().context("Cannot detect the host platform; pass --target-os and --target-arch")?;
    Ok(
      self
        .facts
        .iter()
        .fold(FactSet::for_platform(platform), |facts, (name, value)| {
          facts.with_fact(name.clone(), *value)
        }),
    )
  }

  pub fn load(&self, project: &Path) -> Result<LoadedProject> {
    load_project_for(project, self.platform())
      .with_context(|| format!("Failed to load project: {}", project.display()))
  }
}

fn parse_fact(arg: &str) -> Result<(String, bool), String> {
  let (name, value) = match arg.split_once('=') {
    Some((name, value)) => (name.trim(), value.trim()),
    None => (arg.trim(), "true"),
  };
  if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
    return Err(format!("invalid fact name '{}'", name));
  }
  let value = match value.to_ascii_lowercase().as_str() {
    "true" | "1" | "yes" => true,
    "false" | "0" | "no" => false,
    other => return Err(format!("invalid fact value '{}', expected true or false", other)),
  };
  Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_facts() {
    assert_eq!(parse_fact("fips").unwrap(), ("fips".to_string(), true));
    assert_eq!(parse_fact("fips=false").unwrap(), ("fips".to_string(), false));
    assert_eq!(parse_fact("heroku_target=1").unwrap(), ("heroku_target".to_string(), true));
    assert!(parse_fact("fips=maybe").is_err());
    assert!(parse_fact("=true").is_err());
    assert!(parse_fact("a-b").is_err());
  }

  #[test]
  fn explicit_target_overrides_host() {
    let args = TargetArgs {
      target_os: Some(Os::MacOs),
      target_arch: Some(Arch::Aarch64),
      facts: vec![("fips".to_string(), true)],
    };
    assert_eq!(args.platform(), Some(Platform::new(Arch::Aarch64, Os::MacOs)));

    let facts = args.fact_set().unwrap();
    assert_eq!(facts.get("osx_target"), Some(true));
    assert_eq!(facts.get("fips"), Some(true));
  }
}
