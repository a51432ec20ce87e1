//! Node context for dependency injection.

use std::sync::Arc;

use anyhow::Context;

use crate::config::NodeConfig;
use crate::coordinator::ClusterCoordinator;
use crate::inventory::{InventoryScanner, Reconciler};
use crate::listener::{ListenerSettings, OperationListener};
use crate::processor::{BundleLocks, OperationProcessor, ProcessorSettings, RetryPolicy};
use crate::runtime::{LocalRuntime, PackageRuntime};
use crate::staging::{ContentStager, DirectoryStager};
use crate::store::{FsTreeStore, ModuleRepository, TreeStore};

/// Everything one cluster node needs, built once from its configuration.
///
/// Frontends create this and hand out the services they need. Stores and
/// runtimes are shared, so services obtained from the same context see the
/// same state.
#[derive(Debug, Clone)]
pub struct NodeContext {
    config: NodeConfig,
    store: Arc<dyn TreeStore>,
    runtime: Arc<dyn PackageRuntime>,
    stager: Arc<dyn ContentStager>,
    bundle_locks: BundleLocks,
}

impl NodeContext {
    /// Open the durable store, the local runtime cache and the staging area
    /// named by `config`.
    pub fn open(config: NodeConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let store = FsTreeStore::open(&config.store_dir)
            .with_context(|| format!("Failed to open store at {}", config.store_dir.display()))?;
        let runtime = LocalRuntime::open(&config.runtime_dir)?;
        let stager = DirectoryStager::new(&config.staging_dir);
        Ok(Self::from_parts(
            config,
            Arc::new(store),
            Arc::new(runtime),
            Arc::new(stager),
        ))
    }

    /// Assemble a context from explicit collaborators (for testing).
    pub fn from_parts(
        config: NodeConfig,
        store: Arc<dyn TreeStore>,
        runtime: Arc<dyn PackageRuntime>,
        stager: Arc<dyn ContentStager>,
    ) -> Self {
        Self {
            config,
            store,
            runtime,
            stager,
            bundle_locks: BundleLocks::new(),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn PackageRuntime> {
        &self.runtime
    }

    pub fn repository(&self) -> ModuleRepository {
        ModuleRepository::new(self.store.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry_attempts, self.config.retry_base_delay())
    }

    pub fn coordinator(&self) -> ClusterCoordinator {
        ClusterCoordinator::new(self.repository(), self.stager.clone())
            .with_retry(self.retry_policy())
    }

    pub fn scanner(&self) -> InventoryScanner {
        InventoryScanner::new(self.config.module_headers.clone())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.node_id(),
            self.repository(),
            self.runtime.clone(),
            self.stager.clone(),
            self.scanner(),
        )
        .with_bundle_locks(self.bundle_locks.clone())
    }

    pub fn processor(&self) -> OperationProcessor {
        OperationProcessor::new(
            self.node_id(),
            self.repository(),
            self.runtime.clone(),
            ProcessorSettings {
                stale_after: self.config.stale_after(),
                auto_start: self.config.auto_start,
                retry: self.retry_policy(),
            },
        )
        .with_bundle_locks(self.bundle_locks.clone())
    }

    /// Listener for this node's queue, reconciling periodically when
    /// configured.
    pub fn listener(&self) -> OperationListener {
        let listener = OperationListener::new(
            self.node_id(),
            self.store.clone(),
            self.processor(),
            ListenerSettings {
                workers: self.config.workers,
                sweep_interval: self.config.sweep_interval(),
                reconcile_interval: self.config.reconcile_interval(),
            },
        );
        if self.config.reconcile_interval().is_some() {
            listener.with_reconciler(self.reconciler())
        } else {
            listener
        }
    }
}
