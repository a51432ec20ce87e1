//! Modman Core Library
//!
//! Coordinates bundle lifecycle operations (install, uninstall, start, stop)
//! across cluster nodes that share a hierarchical store. Nodes never talk to
//! each other: the coordinator writes per-node operation records, each node
//! listens to its own subtree, executes what it finds and writes state back.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod fs;
pub mod inventory;
pub mod listener;
pub mod model;
pub mod processor;
pub mod runtime;
pub mod staging;
pub mod store;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::NodeConfig;
    pub use crate::context::NodeContext;

    // Errors
    pub use crate::error::{ErrorKind, ModuleError};

    // Model
    pub use crate::model::{
        BinaryFile, Bundle, ClusterNode, ModuleManagement, NodeBundle, Operation,
        OperationAction, OperationState,
    };

    // Coordination
    pub use crate::coordinator::{
        BundleStateReport, ClusterCoordinator, NodeOutcome, OperationResult, UploadedContent,
    };
    pub use crate::listener::{ListenerHandle, OperationListener};
    pub use crate::processor::{BundleLocks, OperationProcessor, ProcessSummary};

    // Inventory
    pub use crate::inventory::{Reconciler, ScanIssue, ScanReport};

    // Capabilities
    pub use crate::runtime::{LoadedPackage, LocalRuntime, PackageRuntime};
    pub use crate::staging::{ContentStager, DirectoryStager};
    pub use crate::store::{FsTreeStore, MemoryTreeStore, StoreError, TreeStore};
}
