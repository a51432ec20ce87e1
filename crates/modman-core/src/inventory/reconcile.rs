//! Bring the shared catalog and this node's bundle table in line with what
//! the local runtime actually has loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::model::Bundle;
use crate::processor::BundleLocks;
use crate::runtime::PackageRuntime;
use crate::staging::ContentStager;
use crate::store::ModuleRepository;

use super::scanner::{InventoryScanner, ScanIssue, ScanReport, populate_bundles, populate_node_bundles};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Catalog entries written because their content was new or changed.
    pub catalog_updated: Vec<String>,
    /// Node bundle entries written.
    pub node_updated: Vec<String>,
    /// Node bundle entries removed because nothing is loaded for them.
    pub node_removed: Vec<String>,
    /// Bundles left alone because an operation on them is in flight.
    pub skipped_in_flight: Vec<String>,
    pub issues: Vec<ScanIssue>,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    node_id: String,
    repository: ModuleRepository,
    runtime: Arc<dyn PackageRuntime>,
    stager: Arc<dyn ContentStager>,
    scanner: InventoryScanner,
    bundle_locks: BundleLocks,
}

impl Reconciler {
    pub fn new(
        node_id: impl Into<String>,
        repository: ModuleRepository,
        runtime: Arc<dyn PackageRuntime>,
        stager: Arc<dyn ContentStager>,
        scanner: InventoryScanner,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            repository,
            runtime,
            stager,
            scanner,
            bundle_locks: BundleLocks::new(),
        }
    }

    /// Serialize node entry writes with a processor on this node.
    pub fn with_bundle_locks(mut self, bundle_locks: BundleLocks) -> Self {
        self.bundle_locks = bundle_locks;
        self
    }

    pub fn scan(&self) -> anyhow::Result<ScanReport> {
        self.scanner.scan(self.runtime.as_ref())
    }

    /// Merge the runtime inventory into the catalog and this node's bundle
    /// table.
    ///
    /// Node entries are only written under the bundle's lock, and only when
    /// no record of that bundle is queued, running, or finished since the
    /// scan started: in all those cases the processor's result wins.
    pub fn reconcile(&self) -> anyhow::Result<ReconcileReport> {
        let scan_started = Utc::now();
        let scan = self.scan()?;
        let mut management = self
            .repository
            .load_management()
            .context("Failed to load module management tree")?;
        let catalog_before = management.bundles.clone();

        let scan = self.share_content(scan, &catalog_before);
        let states = populate_bundles(&mut management, &scan);

        let mut report = ReconcileReport {
            issues: scan.issues.clone(),
            ..ReconcileReport::default()
        };

        for (name, bundle) in &management.bundles {
            if !scan.bundles.contains_key(name) {
                continue;
            }
            let unchanged = catalog_before
                .get(name)
                .is_some_and(|before| before == bundle);
            if !unchanged {
                self.repository.save_bundle(bundle)?;
                report.catalog_updated.push(name.clone());
            }
        }

        let observed: BTreeMap<String, Bundle> = scan
            .bundles
            .iter()
            .map(|(name, scanned)| (name.clone(), scanned.bundle.clone()))
            .collect();
        let node = management.node_mut(&self.node_id);
        let before = node.bundles.clone();
        populate_node_bundles(node, &observed, Some(&states));

        let loaded: BTreeSet<String> = self
            .runtime
            .packages()?
            .iter()
            .filter_map(|package| package.composite_name())
            .collect();
        let candidates: BTreeSet<&String> = observed.keys().chain(before.keys()).collect();

        for name in candidates {
            let lock = self.bundle_locks.get(name);
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.touched_since(name, scan_started)? {
                report.skipped_in_flight.push(name.clone());
                continue;
            }
            if observed.contains_key(name) {
                let Some(node_bundle) = node.bundles.get(name) else {
                    continue;
                };
                if before.get(name) != Some(node_bundle) {
                    self.repository.put_node_bundle(&self.node_id, node_bundle)?;
                    report.node_updated.push(name.clone());
                }
            } else if !loaded.contains(name) {
                // Tracked but no longer loaded: drift, drop the entry.
                if self.repository.remove_node_bundle(&self.node_id, name)? {
                    report.node_removed.push(name.clone());
                }
            }
        }

        info!(
            node = %self.node_id,
            catalog_updated = report.catalog_updated.len(),
            node_updated = report.node_updated.len(),
            node_removed = report.node_removed.len(),
            skipped = report.skipped_in_flight.len(),
            issues = report.issues.len(),
            "Inventory reconciled"
        );
        Ok(report)
    }

    /// Whether the queue has a record of `bundle` that is not finished, or
    /// that finished after `since`.
    fn touched_since(&self, bundle: &str, since: DateTime<Utc>) -> anyhow::Result<bool> {
        Ok(self
            .repository
            .operations(&self.node_id)
            .with_context(|| format!("Failed to read the queue of {}", self.node_id))?
            .iter()
            .filter(|op| op.bundle() == bundle)
            .any(|op| {
                !op.state().is_terminal() || op.finished_at().is_some_and(|finished| finished >= since)
            }))
    }

    /// Point scanned bundles at cluster-readable content.
    ///
    /// A bundle whose content the catalog already has keeps the catalog's
    /// file reference. New content is copied from the runtime cache into the
    /// staging area so other nodes can install it.
    fn share_content(&self, mut scan: ScanReport, catalog: &BTreeMap<String, Bundle>) -> ScanReport {
        for (name, scanned) in scan.bundles.iter_mut() {
            if let Some(existing) = catalog.get(name)
                && existing.same_content(&scanned.bundle)
            {
                scanned.bundle = existing.clone();
                continue;
            }
            match self.stage_local_archive(&scanned.bundle) {
                Ok(Some(shared)) => scanned.bundle = shared,
                Ok(None) => {}
                Err(err) => {
                    warn!(bundle = %name, error = %format!("{:#}", err), "Failed to share bundle content, keeping local reference")
                }
            }
        }
        scan
    }

    fn stage_local_archive(&self, bundle: &Bundle) -> anyhow::Result<Option<Bundle>> {
        let Some(path) = bundle.file().and_then(|file| file.to_file_path()) else {
            return Ok(None);
        };
        let file_name = bundle
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.jar", bundle.name()));
        let mut archive = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let staged = self.stager.stage(&file_name, &mut archive)?;
        debug!(bundle = %bundle.name(), path = %staged.path.display(), "Shared local bundle content");
        Ok(Some(
            bundle
                .clone()
                .with_file(staged.binary_file()?)
                .with_checksum(staged.checksum),
        ))
    }
}
