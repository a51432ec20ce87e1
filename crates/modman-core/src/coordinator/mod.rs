//! Administrative entry point: fan one request out into per-node operation
//! records, and read per-node bundle state back.
//!
//! Writes return as soon as the records are durable. Whether a node actually
//! executed its record is only visible through [`ClusterCoordinator::get_state`]
//! and [`ClusterCoordinator::operations`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ModuleError;
use crate::model::{Bundle, Operation, OperationAction, OperationState};
use crate::processor::RetryPolicy;
use crate::runtime::manifest::Manifest;
use crate::staging::ContentStager;
use crate::store::{ModuleRepository, validate_segment};

/// An uploaded bundle archive.
#[derive(Debug, Clone)]
pub struct UploadedContent {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadedContent {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// What happened for one target node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub node: String,
    /// Name of the written record.
    pub operation: Option<String>,
    /// Store path of the written record.
    pub path: Option<String>,
    pub error: Option<String>,
}

impl NodeOutcome {
    pub fn accepted(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub action: OperationAction,
    pub bundle: String,
    pub nodes: Vec<NodeOutcome>,
}

impl OperationResult {
    pub fn all_accepted(&self) -> bool {
        self.nodes.iter().all(NodeOutcome::accepted)
    }

    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|outcome| outcome.node == node)
    }
}

/// An operation that has been written but has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingOperation {
    pub operation: String,
    pub action: OperationAction,
    pub state: OperationState,
}

/// One node's view of one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleState {
    /// Last committed state; `None` if the node never reported one.
    pub state: Option<String>,
    pub checksum: Option<String>,
    /// Latest in-flight operation on this bundle, if any.
    pub pending: Option<PendingOperation>,
}

/// Node → bundle name → state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BundleStateReport {
    pub nodes: BTreeMap<String, BTreeMap<String, BundleState>>,
}

impl BundleStateReport {
    pub fn get(&self, node: &str, bundle: &str) -> Option<&BundleState> {
        self.nodes.get(node).and_then(|bundles| bundles.get(bundle))
    }

    /// Committed state of `bundle` on `node`.
    pub fn state(&self, node: &str, bundle: &str) -> Option<&str> {
        self.get(node, bundle).and_then(|entry| entry.state.as_deref())
    }

    /// Whether any addressed node still has work in flight.
    pub fn is_settled(&self) -> bool {
        self.nodes
            .values()
            .flat_map(BTreeMap::values)
            .all(|entry| entry.pending.is_none())
    }
}

#[derive(Debug, Clone)]
pub struct ClusterCoordinator {
    repository: ModuleRepository,
    stager: Arc<dyn ContentStager>,
    retry: RetryPolicy,
}

impl ClusterCoordinator {
    pub fn new(repository: ModuleRepository, stager: Arc<dyn ContentStager>) -> Self {
        Self {
            repository,
            stager,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stage `content`, record its bundle in the catalog and queue an
    /// install on every node in `nodes`.
    pub fn install(
        &self,
        content: &UploadedContent,
        nodes: &[String],
    ) -> Result<OperationResult, ModuleError> {
        if content.filename.trim().is_empty() {
            return Err(ModuleError::InvalidRequest("filename is required".to_string()));
        }
        if content.bytes.is_empty() {
            return Err(ModuleError::InvalidRequest("content is empty".to_string()));
        }
        let nodes = target_nodes(nodes)?;

        let staged = self
            .stager
            .stage(&content.filename, &mut content.bytes.as_slice())
            .map_err(|err| {
                ModuleError::ManagementFailure(format!("Failed to stage {}: {:#}", content.filename, err))
            })?;
        let manifest = Manifest::from_archive(&staged.path).map_err(|err| {
            ModuleError::InvalidRequest(format!("{} is not a bundle archive: {:#}", content.filename, err))
        })?;
        let (Some(symbolic_name), Some(version)) = (manifest.symbolic_name(), manifest.version())
        else {
            return Err(ModuleError::InvalidRequest(format!(
                "{} has no symbolic name or version",
                content.filename
            )));
        };
        let file = staged.binary_file().map_err(|err| {
            ModuleError::ManagementFailure(format!("{:#}", err))
        })?;
        let staged_name = staged
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let bundle = Bundle::new(symbolic_name, version)
            .with_display_name(manifest.display_name().map(str::to_string))
            .with_file_name(staged_name)
            .with_file(file)
            .with_checksum(staged.checksum.clone());
        validate_segment(&bundle.name()).map_err(|reason| {
            ModuleError::InvalidRequest(format!("Bundle name '{}' {}", bundle.name(), reason))
        })?;

        self.retry
            .run("save bundle", || self.repository.save_bundle(&bundle))?;
        info!(
            bundle = %bundle.name(),
            checksum = %staged.checksum,
            size = staged.size,
            "Bundle staged"
        );
        self.fan_out(OperationAction::Install, &bundle.name(), &nodes)
    }

    pub fn uninstall(
        &self,
        bundle_key: &str,
        nodes: &[String],
    ) -> Result<OperationResult, ModuleError> {
        self.submit(OperationAction::Uninstall, bundle_key, nodes)
    }

    pub fn start(&self, bundle_key: &str, nodes: &[String]) -> Result<OperationResult, ModuleError> {
        self.submit(OperationAction::Start, bundle_key, nodes)
    }

    pub fn stop(&self, bundle_key: &str, nodes: &[String]) -> Result<OperationResult, ModuleError> {
        self.submit(OperationAction::Stop, bundle_key, nodes)
    }

    fn submit(
        &self,
        action: OperationAction,
        bundle_key: &str,
        nodes: &[String],
    ) -> Result<OperationResult, ModuleError> {
        let bundle_key = bundle_key.trim();
        if bundle_key.is_empty() {
            return Err(ModuleError::InvalidRequest("bundle key is required".to_string()));
        }
        validate_segment(bundle_key).map_err(|reason| {
            ModuleError::InvalidRequest(format!("Bundle key '{}' {}", bundle_key, reason))
        })?;
        let nodes = target_nodes(nodes)?;
        self.fan_out(action, bundle_key, &nodes)
    }

    /// Write one pending record per node. Nodes are independent: a failed
    /// write for one node is reported in its outcome and the rest go ahead.
    fn fan_out(
        &self,
        action: OperationAction,
        bundle: &str,
        nodes: &[String],
    ) -> Result<OperationResult, ModuleError> {
        let mut outcomes = Vec::with_capacity(nodes.len());
        let mut last_error: Option<ModuleError> = None;

        for node in nodes {
            let operation = Operation::new(action, bundle, node.as_str())
                .with_name(operation_name())
                .with_created_at(Utc::now());
            match self
                .retry
                .run("write operation", || self.repository.create_operation(&operation))
            {
                Ok(stored) => {
                    debug!(node = %node, path = stored.path().unwrap_or_default(), "Operation queued");
                    outcomes.push(NodeOutcome {
                        node: node.clone(),
                        operation: stored.name().map(str::to_string),
                        path: stored.path().map(str::to_string),
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(node = %node, bundle, action = %action, error = %err, "Failed to queue operation");
                    let err = ModuleError::from(err);
                    outcomes.push(NodeOutcome {
                        node: node.clone(),
                        operation: None,
                        path: None,
                        error: Some(err.reason()),
                    });
                    last_error = Some(err);
                }
            }
        }

        let accepted = outcomes.iter().filter(|outcome| outcome.accepted()).count();
        if accepted == 0
            && let Some(err) = last_error
        {
            return Err(err);
        }
        info!(action = %action, bundle, accepted, targets = nodes.len(), "Operation fanned out");
        Ok(OperationResult {
            action,
            bundle: bundle.to_string(),
            nodes: outcomes,
        })
    }

    /// State of one bundle on each of `nodes`.
    pub fn get_state(
        &self,
        bundle_key: &str,
        nodes: &[String],
    ) -> Result<BundleStateReport, ModuleError> {
        let bundle_key = bundle_key.trim();
        if bundle_key.is_empty() {
            return Err(ModuleError::InvalidRequest("bundle key is required".to_string()));
        }
        let mut report = self.read_states(nodes)?;
        for bundles in report.nodes.values_mut() {
            bundles.retain(|name, _| name == bundle_key);
        }
        Ok(report)
    }

    /// State of every bundle on each of `nodes`. An empty set means every
    /// registered node.
    pub fn get_states(&self, nodes: &[String]) -> Result<BundleStateReport, ModuleError> {
        self.read_states(nodes)
    }

    fn read_states(&self, nodes: &[String]) -> Result<BundleStateReport, ModuleError> {
        let nodes = if nodes.is_empty() {
            self.repository.node_ids()?
        } else {
            target_nodes(nodes)?
        };

        let mut report = BundleStateReport::default();
        for node in nodes {
            let mut bundles: BTreeMap<String, BundleState> = self
                .repository
                .node_bundles(&node)?
                .into_iter()
                .map(|(name, entry)| {
                    (
                        name,
                        BundleState {
                            state: Some(entry.state),
                            checksum: entry.checksum,
                            pending: None,
                        },
                    )
                })
                .collect();

            // Newest in-flight record wins.
            for operation in self.repository.operations(&node)? {
                if operation.state().is_terminal() {
                    continue;
                }
                let pending = PendingOperation {
                    operation: operation.name().unwrap_or_default().to_string(),
                    action: operation.action(),
                    state: operation.state(),
                };
                bundles
                    .entry(operation.bundle().to_string())
                    .or_insert_with(|| BundleState {
                        state: None,
                        checksum: None,
                        pending: None,
                    })
                    .pending = Some(pending);
            }
            report.nodes.insert(node, bundles);
        }
        Ok(report)
    }

    /// Every record queued for `node`, oldest first.
    pub fn operations(&self, node: &str) -> Result<Vec<Operation>, ModuleError> {
        validate_node(node)?;
        Ok(self.repository.operations(node)?)
    }

    pub fn operation(&self, node: &str, name: &str) -> Result<Option<Operation>, ModuleError> {
        validate_node(node)?;
        validate_segment(name).map_err(|reason| {
            ModuleError::InvalidRequest(format!("Operation name '{}' {}", name, reason))
        })?;
        Ok(self.repository.operation(node, name)?)
    }

    /// Join `node` to the cluster. Returns whether it was new.
    pub fn register_node(&self, node: &str) -> Result<bool, ModuleError> {
        validate_node(node)?;
        let created = self
            .retry
            .run("register node", || self.repository.register_node(node))?;
        if created {
            info!(node, "Node registered");
        }
        Ok(created)
    }
}

/// Validate and de-duplicate a target node set, keeping first-seen order.
fn target_nodes(nodes: &[String]) -> Result<Vec<String>, ModuleError> {
    if nodes.is_empty() {
        return Err(ModuleError::InvalidRequest("at least one target node is required".to_string()));
    }
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node = node.trim();
        validate_node(node)?;
        if seen.insert(node.to_string()) {
            targets.push(node.to_string());
        }
    }
    Ok(targets)
}

fn validate_node(node: &str) -> Result<(), ModuleError> {
    validate_segment(node)
        .map_err(|reason| ModuleError::InvalidRequest(format!("Node id '{}' {}", node, reason)))
}

/// `op-{unix millis}-{random}`: sortable by time, unique across coordinators.
fn operation_name() -> String {
    format!("op-{}-{}", Utc::now().timestamp_millis(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::DirectoryStager;
    use crate::store::MemoryTreeStore;

    fn coordinator() -> (ClusterCoordinator, ModuleRepository, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().expect("tempdir should succeed");
        let repository = ModuleRepository::new(Arc::new(MemoryTreeStore::new()));
        let stager = Arc::new(DirectoryStager::new(tmp.path().join("staging")));
        let coordinator =
            ClusterCoordinator::new(repository.clone(), stager).with_retry(RetryPolicy::none());
        (coordinator, repository, tmp)
    }

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_blank_bundle_key_is_rejected() {
        let (coordinator, repository, _tmp) = coordinator();
        let err = coordinator
            .stop("  ", &nodes(&["n1"]))
            .expect_err("blank key should be rejected");
        assert!(matches!(err, ModuleError::InvalidRequest(_)));
        assert!(repository.operations("n1").expect("read").is_empty());
    }

    #[test]
    fn test_empty_and_invalid_node_sets_are_rejected() {
        let (coordinator, _repository, _tmp) = coordinator();
        assert!(matches!(
            coordinator.start("demo-1.0", &[]),
            Err(ModuleError::InvalidRequest(_))
        ));
        assert!(matches!(
            coordinator.start("demo-1.0", &nodes(&["n1", "../n2"])),
            Err(ModuleError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_duplicate_nodes_get_one_record() {
        let (coordinator, repository, _tmp) = coordinator();
        let result = coordinator
            .start("demo-1.0", &nodes(&["n1", "n1", "n2"]))
            .expect("start should be accepted");
        assert_eq!(result.nodes.len(), 2);
        assert!(result.all_accepted());
        assert_eq!(repository.operations("n1").expect("read").len(), 1);
        assert_eq!(repository.operations("n2").expect("read").len(), 1);
    }

    #[test]
    fn test_empty_upload_is_rejected_before_staging() {
        let (coordinator, _repository, tmp) = coordinator();
        let err = coordinator
            .install(&UploadedContent::new("demo-1.0.jar", Vec::new()), &nodes(&["n1"]))
            .expect_err("empty content should be rejected");
        assert!(matches!(err, ModuleError::InvalidRequest(_)));
        assert!(!tmp.path().join("staging").exists());
    }

    #[test]
    fn test_pending_records_show_next_to_committed_state() {
        let (coordinator, repository, _tmp) = coordinator();
        repository
            .put_node_bundle(
                "n1",
                &crate::model::NodeBundle::new(&Bundle::new("demo", "1.0")).with_state("active"),
            )
            .expect("write should succeed");
        coordinator
            .stop("demo-1.0", &nodes(&["n1"]))
            .expect("stop should be accepted");

        let report = coordinator
            .get_state("demo-1.0", &nodes(&["n1"]))
            .expect("read should succeed");
        let entry = report.get("n1", "demo-1.0").expect("entry should exist");
        assert_eq!(entry.state.as_deref(), Some("active"));
        let pending = entry.pending.as_ref().expect("stop should be in flight");
        assert_eq!(pending.action, OperationAction::Stop);
        assert_eq!(pending.state, OperationState::Pending);
        assert!(!report.is_settled());
    }

    #[test]
    fn test_operation_names_are_unique() {
        assert_ne!(operation_name(), operation_name());
    }
}
