//! Inventory scanning and reconciliation against a real runtime cache.

mod support;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use modman_core::context::NodeContext;
use modman_core::coordinator::UploadedContent;
use modman_core::inventory::ScanIssueKind;
use modman_core::model::{BinaryFile, Bundle, NodeBundle, Operation, OperationAction};
use modman_core::runtime::{LoadedPackage, PackageRuntime, find_by_name};
use modman_core::staging::DirectoryStager;

use support::{Cluster, bundle_archive, nodes, write_bundle};

#[test]
fn scan_reports_managed_bundles_with_checksum_and_state() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let uploads = cluster.root.path().join("uploads");
    let managed = write_bundle(&uploads, "demo-1.0.jar", "demo", "1.0");
    let plain = uploads.join("lib-2.0.jar");
    std::fs::write(&plain, bundle_archive("lib", "2.0", false)).expect("write should succeed");

    let runtime = n1.runtime();
    let id = runtime
        .install(&BinaryFile::from_path(&managed).expect("path should convert"))
        .expect("install should succeed");
    runtime.start(id).expect("start should succeed");
    runtime
        .install(&BinaryFile::from_path(&plain).expect("path should convert"))
        .expect("install should succeed");

    let report = n1.reconciler().scan().expect("scan should succeed");

    assert_eq!(report.bundles.len(), 1);
    let scanned = &report.bundles["demo-1.0"];
    assert_eq!(scanned.state, "active");
    assert_eq!(scanned.bundle.file_name(), Some("demo-1.0.jar"));
    assert_eq!(scanned.bundle.checksum().map(str::len), Some(64));
    assert!(!report.is_partial());
}

#[test]
fn scan_skips_bundles_whose_archive_is_gone() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let uploads = cluster.root.path().join("uploads");
    let runtime = n1.runtime();
    runtime
        .install(&BinaryFile::from_path(&write_bundle(&uploads, "a-1.0.jar", "a", "1.0")).expect("path"))
        .expect("install should succeed");
    let broken = runtime
        .install(&BinaryFile::from_path(&write_bundle(&uploads, "b-1.0.jar", "b", "1.0")).expect("path"))
        .expect("install should succeed");
    let archive = runtime
        .archive_path(broken)
        .expect("lookup should succeed")
        .expect("archive should exist");
    std::fs::remove_file(archive).expect("remove should succeed");

    let report = n1.reconciler().scan().expect("scan should not fail");

    assert!(report.bundles.contains_key("a-1.0"));
    assert!(!report.bundles.contains_key("b-1.0"));
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].kind, ScanIssueKind::ArchiveMissing);
    assert_eq!(report.issues[0].name.as_deref(), Some("b-1.0"));
}

#[test]
fn reconcile_follows_state_changed_outside_the_queue() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    n1.coordinator()
        .install(
            &UploadedContent::new("demo-1.0.jar", bundle_archive("demo", "1.0", true)),
            &nodes(&["n1"]),
        )
        .expect("install should be accepted");
    n1.processor().process().expect("process should succeed");

    // Someone stops the bundle directly on the node.
    let runtime = n1.runtime();
    let package = find_by_name(runtime.as_ref(), "demo-1.0")
        .expect("runtime should list")
        .expect("bundle should be loaded");
    runtime.stop(package.id).expect("stop should succeed");

    let report = n1.reconciler().reconcile().expect("reconcile should succeed");
    assert_eq!(report.node_updated, vec!["demo-1.0".to_string()]);
    // Content did not change, so the catalog entry is left alone.
    assert!(report.catalog_updated.is_empty());

    let state = n1
        .coordinator()
        .get_state("demo-1.0", &nodes(&["n1"]))
        .expect("read should succeed");
    assert_eq!(state.state("n1", "demo-1.0"), Some("resolved"));

    let again = n1.reconciler().reconcile().expect("reconcile should succeed");
    assert!(again.node_updated.is_empty());
    assert!(again.node_removed.is_empty());
}

#[test]
fn reconcile_drops_entries_for_bundles_no_longer_loaded() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let repository = n1.repository();
    repository
        .put_node_bundle("n1", &NodeBundle::new(&Bundle::new("gone", "1.0")).with_state("active"))
        .expect("write should succeed");

    let report = n1.reconciler().reconcile().expect("reconcile should succeed");

    assert_eq!(report.node_removed, vec!["gone-1.0".to_string()]);
    assert!(repository
        .node_bundles("n1")
        .expect("read should succeed")
        .is_empty());
}

#[test]
fn reconcile_leaves_bundles_with_queued_work_alone() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let repository = n1.repository();
    repository
        .put_node_bundle("n1", &NodeBundle::new(&Bundle::new("demo", "1.0")).with_state("active"))
        .expect("write should succeed");
    n1.coordinator()
        .stop("demo-1.0", &nodes(&["n1"]))
        .expect("stop should be accepted");

    let report = n1.reconciler().reconcile().expect("reconcile should succeed");

    assert!(report.node_removed.is_empty());
    assert!(repository
        .node_bundles("n1")
        .expect("read should succeed")
        .contains_key("demo-1.0"));
}

#[test]
fn reconcile_publishes_locally_loaded_bundles_to_the_catalog() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let uploads = cluster.root.path().join("uploads");
    n1.runtime()
        .install(&BinaryFile::from_path(&write_bundle(&uploads, "demo-1.0.jar", "demo", "1.0")).expect("path"))
        .expect("install should succeed");

    let report = n1.reconciler().reconcile().expect("reconcile should succeed");
    assert_eq!(report.catalog_updated, vec!["demo-1.0".to_string()]);

    let catalog = n1
        .repository()
        .bundle("demo-1.0")
        .expect("read should succeed")
        .expect("catalog entry should exist");
    let staged = catalog
        .file()
        .and_then(BinaryFile::to_file_path)
        .expect("catalog should point at a local file");
    assert!(staged.starts_with(std::fs::canonicalize(cluster.root.path().join("staging")).expect("staging exists")));

    // Another node can install straight from the shared copy.
    let n2 = cluster.node("n2");
    n2.repository()
        .create_operation(&Operation::new(OperationAction::Install, "demo-1.0", "n2").with_name("op-1"))
        .expect("record should be written");
    let summary = n2.processor().process().expect("process should succeed");
    assert_eq!(summary.done, vec!["op-1".to_string()]);
    assert!(find_by_name(n2.runtime().as_ref(), "demo-1.0")
        .expect("runtime should list")
        .is_some());
}

type Hook = Box<dyn FnOnce() + Send>;

/// Runtime view that runs `hook` the first time a package state is read,
/// i.e. while a scan is in progress.
struct MidScanRuntime {
    inner: Arc<dyn PackageRuntime>,
    hook: Mutex<Option<Hook>>,
}

impl std::fmt::Debug for MidScanRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidScanRuntime").field("inner", &self.inner).finish()
    }
}

impl PackageRuntime for MidScanRuntime {
    fn install(&self, file: &BinaryFile) -> anyhow::Result<u64> {
        self.inner.install(file)
    }

    fn uninstall(&self, id: u64) -> anyhow::Result<()> {
        self.inner.uninstall(id)
    }

    fn start(&self, id: u64) -> anyhow::Result<()> {
        self.inner.start(id)
    }

    fn stop(&self, id: u64) -> anyhow::Result<()> {
        self.inner.stop(id)
    }

    fn packages(&self) -> anyhow::Result<Vec<LoadedPackage>> {
        self.inner.packages()
    }

    fn archive_path(&self, id: u64) -> anyhow::Result<Option<PathBuf>> {
        self.inner.archive_path(id)
    }

    fn state(&self, id: u64) -> anyhow::Result<String> {
        let state = self.inner.state(id);
        let hook = self.hook.lock().expect("hook lock should not be poisoned").take();
        if let Some(hook) = hook {
            hook();
        }
        state
    }
}

#[test]
fn reconcile_does_not_resurrect_a_bundle_uninstalled_during_the_scan() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let coordinator = n1.coordinator();
    coordinator
        .install(
            &UploadedContent::new("demo-1.0.jar", bundle_archive("demo", "1.0", true)),
            &nodes(&["n1"]),
        )
        .expect("install should be accepted");
    n1.processor().process().expect("install should process");

    // The uninstall is queued and executed after the scan read "active".
    let processor = n1.processor();
    let uninstall: Hook = Box::new(move || {
        coordinator
            .uninstall("demo-1.0", &nodes(&["n1"]))
            .expect("uninstall should be accepted");
        processor.process().expect("uninstall should process");
    });
    let config = cluster.config("n1");
    let stager = DirectoryStager::new(&config.staging_dir);
    let scanning = NodeContext::from_parts(
        config,
        cluster.store.clone(),
        Arc::new(MidScanRuntime {
            inner: n1.runtime().clone(),
            hook: Mutex::new(Some(uninstall)),
        }),
        Arc::new(stager),
    );

    let report = scanning.reconciler().reconcile().expect("reconcile should succeed");

    assert!(report.node_updated.is_empty());
    assert_eq!(report.skipped_in_flight, vec!["demo-1.0".to_string()]);
    assert!(!n1
        .repository()
        .node_bundles("n1")
        .expect("read should succeed")
        .contains_key("demo-1.0"));
    assert!(find_by_name(n1.runtime().as_ref(), "demo-1.0")
        .expect("runtime should list")
        .is_none());
}
