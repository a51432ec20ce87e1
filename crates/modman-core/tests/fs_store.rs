//! Durable filesystem store: persistence, conditional updates and the
//! module tree on top of it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fs4::FileExt;

use modman_core::model::{Operation, OperationAction, OperationState};
use modman_core::store::{FsTreeStore, ModuleRepository, StoreError, TreeStore};
use serde_json::json;
use tempfile::TempDir;

#[test]
fn nodes_survive_reopening() {
    let temp = TempDir::new().expect("tempdir should succeed");
    {
        let store = FsTreeStore::open(temp.path()).expect("store should open");
        store
            .create("/a/b", json!({ "value": 1 }))
            .expect("create should succeed");
    }

    let store = FsTreeStore::open(temp.path()).expect("store should reopen");
    let node = store
        .get("/a/b")
        .expect("get should succeed")
        .expect("node should exist");
    assert_eq!(node.props["value"], 1);
    assert!(store.get("/a").expect("get should succeed").is_some());
}

#[test]
fn revisions_keep_growing_across_reopen() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let first = FsTreeStore::open(temp.path())
        .expect("store should open")
        .put("/x", json!({}))
        .expect("put should succeed");
    let second = FsTreeStore::open(temp.path())
        .expect("store should reopen")
        .put("/y", json!({}))
        .expect("put should succeed");
    assert!(second.revision > first.revision);
}

#[test]
fn create_refuses_existing_node() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    store.create("/q/1", json!({})).expect("create should succeed");
    assert!(matches!(
        store.create("/q/1", json!({})),
        Err(StoreError::AlreadyExists(_))
    ));
}

#[test]
fn compare_and_set_only_applies_to_the_read_revision() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    let node = store.create("/q/1", json!({ "n": 0 })).expect("create should succeed");

    let won = store
        .compare_and_set("/q/1", node.revision, json!({ "n": 1 }))
        .expect("cas should succeed");
    assert!(won.is_some());
    let lost = store
        .compare_and_set("/q/1", node.revision, json!({ "n": 2 }))
        .expect("cas should succeed");
    assert!(lost.is_none());

    let current = store.get("/q/1").expect("get").expect("node should exist");
    assert_eq!(current.props["n"], 1);
    assert_eq!(current.created, node.created);
}

#[test]
fn children_come_back_in_creation_order() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    for name in ["zeta", "alpha", "mid"] {
        store
            .create(&format!("/q/{}", name), json!({}))
            .expect("create should succeed");
    }
    // Updating a node must not move it in the listing.
    store.put("/q/zeta", json!({ "touched": true })).expect("put should succeed");

    let names: Vec<_> = store
        .children("/q")
        .expect("children should succeed")
        .iter()
        .map(|node| node.name().to_string())
        .collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
}

#[test]
fn remove_drops_the_subtree() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    store.create("/q/1/deep", json!({})).expect("create should succeed");

    assert!(store.remove("/q/1").expect("remove should succeed"));
    assert!(store.get("/q/1/deep").expect("get should succeed").is_none());
    assert!(!store.remove("/q/1").expect("remove should succeed"));
}

#[test]
fn hidden_and_relative_segments_are_rejected() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    assert!(matches!(
        store.put("/q/../escape", json!({})),
        Err(StoreError::InvalidPath { .. })
    ));
    assert!(matches!(
        store.put("/q/.node.json", json!({})),
        Err(StoreError::InvalidPath { .. })
    ));
}

#[test]
fn operation_records_round_trip_through_the_fs_store() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store: Arc<dyn TreeStore> =
        Arc::new(FsTreeStore::open(temp.path()).expect("store should open"));
    let repository = ModuleRepository::new(store);

    let stored = repository
        .create_operation(
            &Operation::new(OperationAction::Start, "demo-1.0", "n1").with_name("op-1"),
        )
        .expect("create should succeed");
    let mut claimed = stored.clone();
    claimed.mark_processing(chrono::Utc::now());
    let claimed = repository
        .replace_operation(&claimed)
        .expect("claim should succeed")
        .expect("claim should apply");
    assert!(repository
        .replace_operation(&stored)
        .expect("stale write should not error")
        .is_none());

    let reopened = ModuleRepository::new(Arc::new(
        FsTreeStore::open(temp.path()).expect("store should reopen"),
    ));
    let read = reopened
        .operation("n1", "op-1")
        .expect("read should succeed")
        .expect("record should exist");
    assert_eq!(read.state(), OperationState::Processing);
    assert_eq!(read.revision(), claimed.revision());
    assert_eq!(read.action(), OperationAction::Start);
    assert_eq!(read.path(), Some("/module-management/nodes/n1/operations/op-1"));
}

#[test]
fn two_handles_on_one_root_do_not_lose_claims() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let first = FsTreeStore::open(temp.path()).expect("store should open");
    let second = FsTreeStore::open(temp.path()).expect("store should open");
    let node = first.create("/q/1", json!({})).expect("create should succeed");

    let handles: Vec<_> = [first, second]
        .into_iter()
        .map(|store| {
            let revision = node.revision;
            std::thread::spawn(move || {
                store
                    .compare_and_set("/q/1", revision, json!({ "owner": true }))
                    .expect("cas should not error")
                    .is_some()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread should not panic"))
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

fn hold_store_lock(root: &std::path::Path) -> std::fs::File {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(root.join(".store.lock"))
        .expect("lock file should open");
    file.try_lock_exclusive().expect("lock should be free");
    file
}

#[test]
fn lock_file_left_by_a_dead_writer_does_not_block_writes() {
    let temp = TempDir::new().expect("tempdir should succeed");
    std::fs::write(temp.path().join(".store.lock"), b"4242").expect("write should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");

    let started = Instant::now();
    store.put("/q/1", json!({})).expect("put should succeed");

    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn writers_wait_for_the_current_lock_holder() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    let held = hold_store_lock(temp.path());
    let holder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        drop(held);
    });

    let started = Instant::now();
    store.put("/q/1", json!({})).expect("put should succeed once released");

    assert!(started.elapsed() >= Duration::from_millis(150));
    holder.join().expect("holder should not panic");
    // Releasing never deletes the file another writer may be locking.
    assert!(temp.path().join(".store.lock").exists());
}

#[test]
fn writes_report_contention_while_the_lock_stays_held() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    let node = store.create("/q/1", json!({ "n": 0 })).expect("create should succeed");
    let _held = hold_store_lock(temp.path());

    let result = store.compare_and_set("/q/1", node.revision, json!({ "n": 1 }));

    assert!(matches!(result, Err(StoreError::Contended(_))));
    assert!(result.is_err_and(|err| err.is_transient()));
    let current = store.get("/q/1").expect("get should succeed").expect("node should exist");
    assert_eq!(current.props["n"], 0);
}

#[test]
fn damaged_revision_counter_stops_writes() {
    let temp = TempDir::new().expect("tempdir should succeed");
    let store = FsTreeStore::open(temp.path()).expect("store should open");
    store.create("/q/1", json!({ "n": 0 })).expect("create should succeed");
    std::fs::write(temp.path().join(".revision"), b"not-a-number").expect("write should succeed");

    let result = store.put("/q/1", json!({ "n": 1 }));

    assert!(matches!(result, Err(StoreError::CorruptRevision { .. })));
    assert!(result.is_err_and(|err| !err.is_transient()));
    let current = store.get("/q/1").expect("get should succeed").expect("node should exist");
    assert_eq!(current.props["n"], 0);
}
