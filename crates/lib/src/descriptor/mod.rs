//! Software descriptors and projects.
//!
//! A [`SoftwareDescriptor`] is the validated, immutable form of one piece of
//! software: where its source comes from, which version to build, and the
//! ordered, possibly conditional steps that build and install it. A
//! [`Project`] names the descriptors a session should produce.
//!
//! # Submodules
//!
//! - `types` - descriptor value types and the validating builder
//! - `spec` - serde form of descriptor files, converted via `TryFrom`
//! - `registry` - name-keyed collection with last-loaded-wins semantics

mod registry;
mod spec;
mod types;

pub use registry::Registry;
pub use spec::{LicenseSpec, ProjectSpec, SoftwareSpec, SourceSpec, StepSpec};
pub use types::*;
