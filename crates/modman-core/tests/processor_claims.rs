//! Claim semantics of the operation processor under concurrency and crashes.

mod support;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use modman_core::coordinator::UploadedContent;
use modman_core::model::{BinaryFile, OperationState};
use modman_core::processor::{OperationProcessor, ProcessorSettings, RetryPolicy};
use modman_core::runtime::{LoadedPackage, LocalRuntime, PackageRuntime};

use support::{Cluster, bundle_archive, nodes};

/// Wraps a real runtime, counts installs and slows them down so that
/// concurrent workers overlap.
#[derive(Debug)]
struct CountingRuntime {
    inner: LocalRuntime,
    installs: AtomicUsize,
}

impl PackageRuntime for CountingRuntime {
    fn install(&self, file: &BinaryFile) -> anyhow::Result<u64> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
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
        self.inner.state(id)
    }
}

fn processor(cluster: &Cluster, runtime: Arc<dyn PackageRuntime>) -> OperationProcessor {
    OperationProcessor::new(
        "n1",
        modman_core::store::ModuleRepository::new(cluster.store.clone()),
        runtime,
        ProcessorSettings {
            retry: RetryPolicy::none(),
            ..ProcessorSettings::default()
        },
    )
}

#[test]
fn concurrent_workers_execute_a_record_once() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    n1.coordinator()
        .install(
            &UploadedContent::new("demo-1.0.jar", bundle_archive("demo", "1.0", true)),
            &nodes(&["n1"]),
        )
        .expect("install should be accepted");

    let runtime = Arc::new(CountingRuntime {
        inner: LocalRuntime::open(cluster.root.path().join("shared-runtime"))
            .expect("runtime should open"),
        installs: AtomicUsize::new(0),
    });

    // Separate processors model separate workers: no shared bundle locks.
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let worker = processor(&cluster, runtime.clone());
            std::thread::spawn(move || worker.process().expect("process should succeed"))
        })
        .collect();
    let summaries: Vec<_> = workers
        .into_iter()
        .map(|handle| handle.join().expect("worker should not panic"))
        .collect();

    assert_eq!(runtime.installs.load(Ordering::SeqCst), 1);
    let executed: usize = summaries.iter().map(|summary| summary.executed()).sum();
    assert_eq!(executed, 1);

    let operations = n1.coordinator().operations("n1").expect("read should succeed");
    assert_eq!(operations[0].state(), OperationState::Done);
}

#[test]
fn stale_processing_claim_is_taken_over() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    n1.coordinator()
        .install(
            &UploadedContent::new("demo-1.0.jar", bundle_archive("demo", "1.0", true)),
            &nodes(&["n1"]),
        )
        .expect("install should be accepted");

    // A worker claimed the record an hour ago and then died.
    let repository = n1.repository();
    let mut crashed = repository.operations("n1").expect("read should succeed").remove(0);
    crashed.mark_processing(Utc::now() - chrono::Duration::hours(1));
    repository
        .replace_operation(&crashed)
        .expect("claim should be written")
        .expect("claim should apply");

    let summary = n1.processor().process().expect("process should succeed");
    assert_eq!(summary.done.len(), 1);

    let report = n1
        .coordinator()
        .get_state("demo-1.0", &nodes(&["n1"]))
        .expect("read should succeed");
    assert_eq!(report.state("n1", "demo-1.0"), Some("active"));
}

#[test]
fn fresh_processing_claim_blocks_later_records() {
    let cluster = Cluster::new();
    let n1 = cluster.node("n1");
    let coordinator = n1.coordinator();
    coordinator
        .install(
            &UploadedContent::new("demo-1.0.jar", bundle_archive("demo", "1.0", true)),
            &nodes(&["n1"]),
        )
        .expect("install should be accepted");
    coordinator
        .stop("demo-1.0", &nodes(&["n1"]))
        .expect("stop should be accepted");

    let repository = n1.repository();
    let mut running = repository.operations("n1").expect("read should succeed").remove(0);
    running.mark_processing(Utc::now());
    repository
        .replace_operation(&running)
        .expect("claim should be written")
        .expect("claim should apply");

    let summary = n1.processor().process().expect("process should succeed");
    assert_eq!(summary.executed(), 0);

    let states: Vec<_> = coordinator
        .operations("n1")
        .expect("read should succeed")
        .iter()
        .map(|op| op.state())
        .collect();
    assert_eq!(states, vec![OperationState::Processing, OperationState::Pending]);
}
