//! kiln-lib: build orchestration for software distributions.
//!
//! A project names the software it needs; each piece of software is a
//! descriptor saying where its source comes from and how to build it. This
//! crate turns the two into an install tree:
//! - `descriptor`: descriptors, projects and the registry they live in
//! - `predicate`: conditions over target facts that gate build steps
//! - `resolve`: dependency graph, cycle detection and build order
//! - `fetch`: git, local and url sources
//! - `step`: command and copy steps with placeholder substitution
//! - `session`: the build session tying it all together
//! - `lua`: loading projects and descriptors from Lua files

pub mod cancel;
pub mod consts;
pub mod descriptor;
pub mod fetch;
pub mod install;
pub mod lua;
pub mod manifest;
pub mod placeholder;
pub mod platform;
pub mod predicate;
pub mod resolve;
pub mod session;
pub mod step;
pub mod util;
