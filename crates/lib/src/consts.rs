//! Constants shared across the crate.

/// Application name, used for directory names under the XDG/AppData roots.
pub const APP_NAME: &str = "kiln";

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";

/// Marker written into a materialized source tree after a successful fetch.
pub const SOURCE_MARKER: &str = ".kiln-source";

/// Marker written into a build cache entry after its files are stored.
pub const BUILD_COMPLETE_MARKER: &str = ".kiln-complete";

/// Subdirectories every install tree is created with.
pub const INSTALL_LAYOUT: &[&str] = &["embedded/lib", "embedded/bin"];

/// File name of the install record written at the end of a session.
pub const INSTALL_RECORD_FILE: &str = "install-record.json";

/// File name of the version manifest written at the end of a session.
pub const VERSION_MANIFEST_FILE: &str = "version-manifest.json";

/// Version markers that float instead of pinning a revision.
pub const FLOATING_VERSIONS: &[&str] = &["main", "master", "HEAD", "latest"];

/// Value for SOURCE_DATE_EPOCH exported to build steps.
/// 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch)
pub const SOURCE_DATE_EPOCH: &str = "315532800";
