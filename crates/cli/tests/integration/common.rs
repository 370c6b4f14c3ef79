//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own project directory and cache directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  /// Create an environment whose project file has `content`.
  pub fn with_project(content: &str) -> Self {
    let env = Self::new();
    env.write_file("project.lua", content);
    env
  }

  /// Write a file relative to the project directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.project_dir().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn project_dir(&self) -> PathBuf {
    let p = self.temp.path().join("project");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Cache path for git mirrors, build results and the work dir.
  pub fn cache_path(&self) -> PathBuf {
    let p = self.temp.path().join("cache");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn work_dir(&self) -> PathBuf {
    self.cache_path().join("work")
  }

  pub fn install_dir(&self) -> PathBuf {
    self.temp.path().join("install")
  }

  /// Get a pre-configured Command for the kiln binary.
  ///
  /// `KILN_CACHE_DIR` points at an isolated cache path.
  pub fn kiln_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("kiln");
    cmd.env("KILN_CACHE_DIR", self.cache_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// `kiln build` for this project, installing into [`Self::install_dir`].
  pub fn build_cmd(&self) -> Command {
    let mut cmd = self.kiln_cmd();
    cmd
      .arg("build")
      .arg(self.project_dir())
      .arg("--install-dir")
      .arg(self.install_dir());
    cmd
  }
}
