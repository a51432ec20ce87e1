//! Package runtime capability: the thing that actually loads, starts and
//! stops bundle code on a node.

pub mod local;
pub mod manifest;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::BinaryFile;

pub use local::LocalRuntime;
pub use manifest::Manifest;

/// Runtime states reported by [`LocalRuntime`]. Other runtimes may report
/// any string; callers lower-case whatever they get.
pub const STATE_INSTALLED: &str = "installed";
pub const STATE_RESOLVED: &str = "resolved";
pub const STATE_ACTIVE: &str = "active";

/// A package currently known to the runtime.
#[derive(Debug, Clone)]
pub struct LoadedPackage {
    /// Runtime-internal numeric id.
    pub id: u64,
    /// Location the package was installed from.
    pub location: String,
    pub manifest: Manifest,
}

impl LoadedPackage {
    pub fn composite_name(&self) -> Option<String> {
        self.manifest.composite_name()
    }

    /// File name of the install location (`.../demo-1.0.jar` → `demo-1.0.jar`).
    pub fn location_file_name(&self) -> Option<String> {
        let parsed = url::Url::parse(&self.location).ok()?;
        parsed
            .path_segments()?
            .next_back()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
    }
}

/// Summary of a package for CLI listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageSummary {
    pub id: u64,
    pub name: Option<String>,
    pub state: String,
}

/// Loads and controls packages on the local node.
///
/// `start` and `stop` must be idempotent: operations are delivered at least
/// once and may be replayed after a crash.
pub trait PackageRuntime: Send + Sync + std::fmt::Debug {
    /// Install (or update in place) the package at `file`. Returns its id.
    fn install(&self, file: &BinaryFile) -> anyhow::Result<u64>;

    fn uninstall(&self, id: u64) -> anyhow::Result<()>;

    fn start(&self, id: u64) -> anyhow::Result<()>;

    fn stop(&self, id: u64) -> anyhow::Result<()>;

    /// Every loaded package with its manifest.
    fn packages(&self) -> anyhow::Result<Vec<LoadedPackage>>;

    /// Archive backing package `id` in the runtime's cache. `Ok(None)` when
    /// the cache entry exists but its archive is gone.
    fn archive_path(&self, id: u64) -> anyhow::Result<Option<PathBuf>>;

    /// Current lifecycle state of package `id`.
    fn state(&self, id: u64) -> anyhow::Result<String>;
}

/// Find a loaded package by composite name.
pub fn find_by_name(
    runtime: &dyn PackageRuntime,
    name: &str,
) -> anyhow::Result<Option<LoadedPackage>> {
    Ok(runtime
        .packages()?
        .into_iter()
        .find(|package| package.composite_name().as_deref() == Some(name)))
}

/// Current state of every loaded package.
pub fn summarize(runtime: &dyn PackageRuntime) -> anyhow::Result<Vec<PackageSummary>> {
    runtime
        .packages()?
        .into_iter()
        .map(|package| {
            Ok(PackageSummary {
                id: package.id,
                name: package.composite_name(),
                state: runtime.state(package.id)?.to_lowercase(),
            })
        })
        .collect()
}
