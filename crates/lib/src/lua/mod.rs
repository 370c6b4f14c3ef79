//! Lua project and software files.
//!
//! A project file returns a table describing what to build:
//!
//! ```lua
//! return {
//!   name = "datadog-updater",
//!   dependencies = { "preparation", "updater", "sds", "version-manifest" },
//!   install_dir = "/opt/datadog-packages",   -- optional
//!   software_dirs = { "software" },          -- optional, this is the default
//!   software = { ... },                      -- optional inline descriptors
//! }
//! ```
//!
//! Every `*.lua` file in each software dir returns one descriptor table.
//! Dirs load in the order listed, files in name order, inline descriptors
//! last; a later definition of a name replaces an earlier one.

pub mod runtime;

use std::fs;
use std::path::{Path, PathBuf};

use mlua::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::descriptor::{DescriptorError, Project, ProjectSpec, Registry, SoftwareDescriptor, SoftwareSpec};
use crate::platform::Platform;

/// File looked up when a directory is given as the project path.
pub const PROJECT_FILE: &str = "project.lua";

const DEFAULT_SOFTWARE_DIR: &str = "software";

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("failed to evaluate {}: {message}", .path.display())]
  Lua { path: PathBuf, message: String },

  #[error("{} must return a table", .path.display())]
  NotATable { path: PathBuf },

  #[error("{}: {source}", .path.display())]
  Descriptor {
    path: PathBuf,
    #[source]
    source: DescriptorError,
  },

  #[error("cannot read {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// A project together with every descriptor it can see.
#[derive(Debug)]
pub struct LoadedProject {
  pub project: Project,
  pub registry: Registry,
  /// Files evaluated, in load order.
  pub files: Vec<PathBuf>,
}

/// Load a project for the host platform.
pub fn load_project(path: &Path) -> Result<LoadedProject, LoadError> {
  load_project_for(path, Platform::current())
}

/// Load a project, exposing `platform` to the Lua files as `kiln.platform`.
pub fn load_project_for(path: &Path, platform: Option<Platform>) -> Result<LoadedProject, LoadError> {
  let project_file = if path.is_dir() { path.join(PROJECT_FILE) } else { path.to_path_buf() };
  let project_file = dunce::canonicalize(&project_file).map_err(|source| LoadError::Io {
    path: project_file.clone(),
    source,
  })?;
  let project_dir = project_file.parent().unwrap_or(Path::new(".")).to_path_buf();

  let lua = runtime::create_runtime(platform, &project_dir).map_err(|e| lua_error(&project_file, e))?;
  let spec: ProjectSpec = eval_table(&lua, &project_file)?;

  let mut files = vec![project_file.clone()];
  let mut registry = Registry::new();

  let (dirs, explicit) = match &spec.software_dirs {
    Some(dirs) => (dirs.clone(), true),
    None => (vec![DEFAULT_SOFTWARE_DIR.to_string()], false),
  };

  for dir in dirs {
    let dir = project_dir.join(dir);
    if !dir.is_dir() && !explicit {
      debug!(dir = %dir.display(), "no software directory");
      continue;
    }
    for file in software_files(&dir)? {
      let descriptor = load_software_file(&lua, &file)?;
      registry.register(descriptor);
      files.push(file);
    }
  }

  for software in spec.software {
    let descriptor = SoftwareDescriptor::try_from(software).map_err(|source| LoadError::Descriptor {
      path: project_file.clone(),
      source,
    })?;
    registry.register(descriptor);
  }

  let mut project = spec
    .dependencies
    .into_iter()
    .fold(Project::new(spec.name, &project_dir), |p, d| p.dependency(d));
  if let Some(install_dir) = spec.install_dir {
    project = project.with_install_dir(install_dir);
  }

  info!(
    project = %project.name,
    descriptors = registry.len(),
    files = files.len(),
    "loaded project"
  );

  Ok(LoadedProject {
    project,
    registry,
    files,
  })
}

/// Evaluate one software file into a validated descriptor.
pub fn load_software_file(lua: &Lua, path: &Path) -> Result<SoftwareDescriptor, LoadError> {
  let spec: SoftwareSpec = eval_table(lua, path)?;
  SoftwareDescriptor::try_from(spec).map_err(|source| LoadError::Descriptor {
    path: path.to_path_buf(),
    source,
  })
}

fn eval_table<T: serde::de::DeserializeOwned>(lua: &Lua, path: &Path) -> Result<T, LoadError> {
  let value = runtime::load_file(lua, path).map_err(|e| lua_error(path, e))?;
  if !value.is_table() {
    return Err(LoadError::NotATable {
      path: path.to_path_buf(),
    });
  }
  lua.from_value(value).map_err(|e| lua_error(path, e))
}

/// `*.lua` files directly inside `dir`, sorted by name.
fn software_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
  let entries = fs::read_dir(dir).map_err(|source| LoadError::Io {
    path: dir.to_path_buf(),
    source,
  })?;

  let mut files = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|source| LoadError::Io {
      path: dir.to_path_buf(),
      source,
    })?;
    let path = entry.path();
    if path.is_file() && path.extension().is_some_and(|ext| ext == "lua") {
      files.push(path);
    }
  }
  files.sort();
  Ok(files)
}

fn lua_error(path: &Path, err: LuaError) -> LoadError {
  LoadError::Lua {
    path: path.to_path_buf(),
    message: err.to_string(),
  }
}
