//! Local bundle inventory: what the runtime actually has loaded, and how
//! that is merged back into the shared catalog.

pub mod reconcile;
pub mod scanner;

pub use reconcile::{ReconcileReport, Reconciler};
pub use scanner::{
    InventoryScanner, ScanIssue, ScanIssueKind, ScanReport, ScannedBundle, populate_bundles,
    populate_node_bundles,
};
