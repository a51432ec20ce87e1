//! Cluster membership and the per-node view of bundles.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Bundle;

/// State given to a node bundle that has never been observed.
pub const DEFAULT_NODE_BUNDLE_STATE: &str = "installed";

/// A node's observation of one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBundle {
    /// Name under which the node tracks the bundle.
    pub name: String,
    /// Catalog key of the bundle definition.
    pub bundle: String,
    /// Checksum of the definition at the time of observation.
    pub checksum: Option<String>,
    /// Lower-cased runtime state (`installed`, `active`, `resolved`, ...).
    pub state: String,
}

impl NodeBundle {
    /// Track `bundle` under its own composite name.
    pub fn new(bundle: &Bundle) -> Self {
        let name = bundle.name();
        Self {
            bundle: name.clone(),
            name,
            checksum: bundle.checksum().map(str::to_string),
            state: DEFAULT_NODE_BUNDLE_STATE.to_string(),
        }
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    pub bundles: BTreeMap<String, NodeBundle>,
}

impl ClusterNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bundles: BTreeMap::new(),
        }
    }
}

/// Root aggregate: the bundle catalog plus every known cluster node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleManagement {
    pub bundles: BTreeMap<String, Bundle>,
    pub nodes: BTreeMap<String, ClusterNode>,
}

impl ModuleManagement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_mut(&mut self, id: &str) -> &mut ClusterNode {
        self.nodes
            .entry(id.to_string())
            .or_insert_with(|| ClusterNode::new(id))
    }
}
