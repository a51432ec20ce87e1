//! Scan the local runtime for managed bundles.
//!
//! Scanning is best effort: a package whose archive or state cannot be
//! resolved is reported as a [`ScanIssue`] and the scan moves on.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::fs::checksum_file;
use crate::model::{BinaryFile, Bundle, ClusterNode, ModuleManagement, NodeBundle};
use crate::runtime::{LoadedPackage, PackageRuntime};

/// Reported state when the runtime cannot tell.
pub const UNKNOWN_STATE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanIssueKind {
    /// No symbolic name or version in the manifest.
    MissingIdentity,
    /// The runtime has no cache entry for the package id.
    LookupFailed,
    /// The cache entry exists but its archive is gone.
    ArchiveMissing,
    /// The archive could not be read for checksumming.
    ChecksumFailed,
    /// The runtime could not report a state; `unknown` was used.
    StateUnavailable,
}

/// One package the scan could not fully cover.
#[derive(Debug, Clone, Serialize)]
pub struct ScanIssue {
    pub package_id: u64,
    pub name: Option<String>,
    pub kind: ScanIssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedBundle {
    pub bundle: Bundle,
    /// Lower-cased runtime state.
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    /// Scanned bundles keyed by composite name.
    pub bundles: BTreeMap<String, ScannedBundle>,
    pub issues: Vec<ScanIssue>,
}

impl ScanReport {
    /// Whether some packages were skipped or degraded.
    pub fn is_partial(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Observed name → state map.
    pub fn states(&self) -> HashMap<String, String> {
        self.bundles
            .iter()
            .map(|(name, scanned)| (name.clone(), scanned.state.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct InventoryScanner {
    module_headers: Vec<String>,
}

impl InventoryScanner {
    /// `module_headers`: a package is managed if its manifest has any of them.
    pub fn new(module_headers: Vec<String>) -> Self {
        Self { module_headers }
    }

    pub fn scan(&self, runtime: &dyn PackageRuntime) -> anyhow::Result<ScanReport> {
        let mut report = ScanReport::default();
        for package in runtime.packages()? {
            if !package.manifest.has_any(&self.module_headers) {
                continue;
            }
            match self.scan_package(runtime, &package) {
                Ok((scanned, issue)) => {
                    report.issues.extend(issue);
                    report.bundles.insert(scanned.bundle.name(), scanned);
                }
                Err(issue) => report.issues.push(issue),
            }
        }
        debug!(
            bundles = report.bundles.len(),
            issues = report.issues.len(),
            "Inventory scan finished"
        );
        Ok(report)
    }

    fn scan_package(
        &self,
        runtime: &dyn PackageRuntime,
        package: &LoadedPackage,
    ) -> Result<(ScannedBundle, Option<ScanIssue>), ScanIssue> {
        let issue = |kind, name: Option<String>, detail: String| ScanIssue {
            package_id: package.id,
            name,
            kind,
            detail,
        };

        let (Some(symbolic_name), Some(version)) =
            (package.manifest.symbolic_name(), package.manifest.version())
        else {
            warn!(id = package.id, "Managed package has no symbolic name or version");
            return Err(issue(
                ScanIssueKind::MissingIdentity,
                None,
                "manifest lacks symbolic name or version".to_string(),
            ));
        };
        let bundle = Bundle::new(symbolic_name, version)
            .with_display_name(package.manifest.display_name().map(str::to_string))
            .with_file_name(package.location_file_name());
        let name = bundle.name();

        let archive = match runtime.archive_path(package.id) {
            Ok(Some(archive)) => archive,
            Ok(None) => {
                warn!(bundle = %name, id = package.id, "Unable to find the archive of the bundle");
                return Err(issue(
                    ScanIssueKind::ArchiveMissing,
                    Some(name),
                    "archive missing from runtime cache".to_string(),
                ));
            }
            Err(err) => {
                error!(bundle = %name, id = package.id, error = %format!("{:#}", err), "Failed to locate bundle archive");
                return Err(issue(
                    ScanIssueKind::LookupFailed,
                    Some(name),
                    format!("{:#}", err),
                ));
            }
        };

        let checksum = checksum_file(&archive).map_err(|err| {
            error!(bundle = %name, path = %archive.display(), error = %format!("{:#}", err), "Failed to checksum bundle archive");
            issue(ScanIssueKind::ChecksumFailed, Some(name.clone()), format!("{:#}", err))
        })?;
        let file = BinaryFile::from_path(&archive).map_err(|err| {
            issue(ScanIssueKind::LookupFailed, Some(name.clone()), format!("{:#}", err))
        })?;
        let bundle = bundle.with_file(file).with_checksum(checksum);

        let (state, degraded) = match runtime.state(package.id) {
            Ok(state) => (state.to_lowercase(), None),
            Err(err) => {
                warn!(bundle = %name, error = %format!("{:#}", err), "Runtime state unavailable");
                (
                    UNKNOWN_STATE.to_string(),
                    Some(issue(
                        ScanIssueKind::StateUnavailable,
                        Some(name.clone()),
                        format!("{:#}", err),
                    )),
                )
            }
        };

        Ok((ScannedBundle { bundle, state }, degraded))
    }
}

/// Merge scanned bundles into the catalog (overwrite by name) and return
/// the observed name → state map.
pub fn populate_bundles(
    management: &mut ModuleManagement,
    report: &ScanReport,
) -> HashMap<String, String> {
    let mut states = HashMap::with_capacity(report.bundles.len());
    for (name, scanned) in &report.bundles {
        management
            .bundles
            .insert(name.clone(), scanned.bundle.clone());
        states.insert(name.clone(), scanned.state.clone());
    }
    states
}

/// Build or overwrite `node`'s entries for every bundle in `sources`.
///
/// A known state from `states` wins; otherwise the entry keeps the state it
/// already had, or the default for new entries.
pub fn populate_node_bundles(
    node: &mut ClusterNode,
    sources: &BTreeMap<String, Bundle>,
    states: Option<&HashMap<String, String>>,
) {
    for (name, bundle) in sources {
        let mut node_bundle = NodeBundle::new(bundle);
        node_bundle.name = name.clone();
        if let Some(previous) = node.bundles.get(name) {
            node_bundle.state = previous.state.clone();
        }
        if let Some(state) = states.and_then(|states| states.get(name)) {
            node_bundle.state = state.clone();
        }
        node.bundles.insert(name.clone(), node_bundle);
    }
}
