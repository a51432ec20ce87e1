//! Typed access to the module management tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::model::{Bundle, ClusterNode, ModuleManagement, NodeBundle, Operation};

use super::schema;
use super::{StoreError, TreeStore};

#[derive(Debug, Clone)]
pub struct ModuleRepository {
    store: Arc<dyn TreeStore>,
}

impl ModuleRepository {
    pub fn new(store: Arc<dyn TreeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    /// Create the node's marker if missing. Returns whether it was created.
    pub fn register_node(&self, node: &str) -> Result<bool, StoreError> {
        match self
            .store
            .create(&schema::node_path(node), schema::cluster_node_props(node, Utc::now()))
        {
            Ok(_) => Ok(true),
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn node_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .children(&schema::nodes_path())?
            .iter()
            .map(|n| n.name().to_string())
            .collect())
    }

    pub fn bundle(&self, name: &str) -> Result<Option<Bundle>, StoreError> {
        self.store
            .get(&schema::bundle_path(name))?
            .map(|node| schema::bundle_from_node(&node))
            .transpose()
    }

    pub fn save_bundle(&self, bundle: &Bundle) -> Result<(), StoreError> {
        self.store
            .put(&schema::bundle_path(&bundle.name()), schema::bundle_to_props(bundle))?;
        Ok(())
    }

    /// Catalog plus every registered node with its bundle entries.
    pub fn load_management(&self) -> Result<ModuleManagement, StoreError> {
        let mut management = ModuleManagement::new();
        for node in self.store.children(&schema::bundles_path())? {
            match schema::bundle_from_node(&node) {
                Ok(bundle) => {
                    management.bundles.insert(node.name().to_string(), bundle);
                }
                Err(err) => warn!(path = %node.path, error = %err, "Skipping unreadable bundle"),
            }
        }
        for node_id in self.node_ids()? {
            let bundles = self.node_bundles(&node_id)?;
            management.nodes.insert(
                node_id.clone(),
                ClusterNode {
                    id: node_id,
                    bundles,
                },
            );
        }
        Ok(management)
    }

    pub fn node_bundles(&self, node: &str) -> Result<BTreeMap<String, NodeBundle>, StoreError> {
        let mut bundles = BTreeMap::new();
        for entry in self.store.children(&schema::node_bundles_path(node))? {
            match schema::node_bundle_from_node(&entry) {
                Ok(node_bundle) => {
                    bundles.insert(entry.name().to_string(), node_bundle);
                }
                Err(err) => {
                    warn!(path = %entry.path, error = %err, "Skipping unreadable node bundle")
                }
            }
        }
        Ok(bundles)
    }

    pub fn put_node_bundle(&self, node: &str, node_bundle: &NodeBundle) -> Result<(), StoreError> {
        self.store.put(
            &schema::node_bundle_path(node, &node_bundle.name),
            schema::node_bundle_to_props(node_bundle),
        )?;
        Ok(())
    }

    pub fn remove_node_bundle(&self, node: &str, name: &str) -> Result<bool, StoreError> {
        self.store.remove(&schema::node_bundle_path(node, name))
    }

    /// Every operation record of `node`, oldest first. Unreadable records are
    /// logged and left out.
    pub fn operations(&self, node: &str) -> Result<Vec<Operation>, StoreError> {
        let mut operations = Vec::new();
        for entry in self.store.children(&schema::operations_path(node))? {
            match schema::operation_from_node(&entry) {
                Ok(operation) => operations.push(operation),
                Err(err) => warn!(path = %entry.path, error = %err, "Skipping unreadable operation"),
            }
        }
        Ok(operations)
    }

    pub fn operation(&self, node: &str, name: &str) -> Result<Option<Operation>, StoreError> {
        self.store
            .get(&schema::operation_path(node, name))?
            .map(|entry| schema::operation_from_node(&entry))
            .transpose()
    }

    /// Write a new record into its node's queue. The operation must carry an
    /// explicit name; the returned copy knows its path and revision.
    pub fn create_operation(&self, operation: &Operation) -> Result<Operation, StoreError> {
        let name = operation
            .explicit_name()
            .ok_or_else(|| StoreError::Schema {
                path: schema::operations_path(operation.node()),
                reason: "operation has no name".to_string(),
            })?;
        let path = schema::operation_path(operation.node(), name);
        let node = self.store.create(&path, schema::operation_to_props(operation))?;
        Ok(operation.clone().stored_at(node.path, node.revision))
    }

    /// Replace a record if nobody wrote it since it was read.
    /// Returns the stored copy, or `None` when the revision moved on.
    pub fn replace_operation(&self, operation: &Operation) -> Result<Option<Operation>, StoreError> {
        let Some(path) = operation.path() else {
            return Err(StoreError::Schema {
                path: schema::operations_path(operation.node()),
                reason: "operation was never stored".to_string(),
            });
        };
        let written = self.store.compare_and_set(
            path,
            operation.revision(),
            schema::operation_to_props(operation),
        )?;
        Ok(written.map(|node| operation.clone().stored_at(node.path, node.revision)))
    }

    pub fn remove_operation(&self, operation: &Operation) -> Result<bool, StoreError> {
        match operation.path() {
            Some(path) => self.store.remove(path),
            None => Ok(false),
        }
    }
}
