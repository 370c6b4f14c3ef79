//! Version manifest reporting.
//!
//! Successful descriptors are reported to a [`ManifestSink`] as
//! `{name, version}` entries. What the sink does with them is up to the
//! caller; [`VersionManifest`] collects them and writes JSON.

mod types;

pub use types::*;
