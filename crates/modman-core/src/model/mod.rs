//! Domain model: bundles, cluster nodes and operation records.
//!
//! These types carry no storage knowledge; `store::schema` maps them to and
//! from the shared tree.

pub mod bundle;
pub mod cluster;
pub mod operation;

pub use bundle::{BinaryFile, Bundle, DEFAULT_MIME_TYPE};
pub use cluster::{ClusterNode, DEFAULT_NODE_BUNDLE_STATE, ModuleManagement, NodeBundle};
pub use operation::{Operation, OperationAction, OperationState};
