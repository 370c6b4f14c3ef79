use std::path::Path;

use mlua::prelude::*;

use crate::platform::Platform;

/// Create a Lua runtime for evaluating project and software files.
///
/// Registers the `kiln` global table:
/// - `kiln.platform` - target triple (e.g. "x86_64-linux")
/// - `kiln.os` / `kiln.arch` - its components
/// - `kiln.dir` - directory of the file being evaluated
///
/// `<project_dir>/lua` is prepended to `package.path` so software files can
/// share helper modules with `require`.
pub fn create_runtime(platform: Option<Platform>, project_dir: &Path) -> LuaResult<Lua> {
  let lua = Lua::new();

  let package: LuaTable = lua.globals().get("package")?;
  let package_path: String = package.get("path")?;
  let lua_dir = project_dir.join("lua");
  package.set(
    "path",
    format!(
      "{dir}/?.lua;{dir}/?/init.lua;{rest}",
      dir = lua_dir.to_string_lossy().replace('\\', "/"),
      rest = package_path
    ),
  )?;

  let kiln = lua.create_table()?;
  match platform {
    Some(platform) => {
      kiln.set("platform", platform.triple())?;
      kiln.set("os", platform.os.as_str())?;
      kiln.set("arch", platform.arch.as_str())?;
    }
    None => {
      kiln.set("platform", "unknown")?;
      kiln.set("os", "unknown")?;
      kiln.set("arch", "unknown")?;
    }
  }
  kiln.set("dir", project_dir.to_string_lossy().to_string())?;
  lua.globals().set("kiln", kiln)?;

  Ok(lua)
}

/// Evaluate a Lua file and return its result.
///
/// `kiln.dir` is set to the file's directory while it runs. Chunk names
/// use `@path` so errors point at the file.
pub fn load_file(lua: &Lua, path: &Path) -> LuaResult<LuaValue> {
  let canonical_path = dunce::canonicalize(path)
    .map_err(|e| LuaError::external(format!("cannot canonicalize '{}': {}", path.display(), e)))?;
  let content = std::fs::read_to_string(&canonical_path)
    .map_err(|e| LuaError::external(format!("cannot read '{}': {}", canonical_path.display(), e)))?;

  let kiln: LuaTable = lua.globals().get("kiln")?;
  kiln.set(
    "dir",
    canonical_path
      .parent()
      .unwrap_or(Path::new(""))
      .to_string_lossy()
      .to_string(),
  )?;

  lua
    .load(&content)
    .set_name(format!("@{}", canonical_path.display()))
    .eval::<LuaValue>()
}
