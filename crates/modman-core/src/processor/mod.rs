//! Execute the operation records queued for this node.
//!
//! A record is claimed by compare-and-set on its revision, so when several
//! workers see the same record only one of them runs it. Records of the same
//! bundle are executed strictly in creation order: a non-terminal record
//! blocks every later record of its bundle until it finishes.

mod retry;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::ModuleError;
use crate::fs::checksum_file;
use crate::model::{Bundle, NodeBundle, Operation, OperationAction, OperationState};
use crate::runtime::{LoadedPackage, PackageRuntime, find_by_name};
use crate::store::{ModuleRepository, StoreError};

pub use retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// A `processing` claim older than this may be taken over.
    pub stale_after: chrono::Duration,
    /// Start bundles right after installing them.
    pub auto_start: bool,
    pub retry: RetryPolicy,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::minutes(15),
            auto_start: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// What one call to [`OperationProcessor::process`] did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessSummary {
    /// Names of records that finished `done`.
    pub done: Vec<String>,
    /// Names of records that finished `failed`.
    pub failed: Vec<String>,
    /// Claims lost to another worker.
    pub lost_claims: usize,
    /// Records executed whose outcome could not be written back.
    pub unrecorded: usize,
}

impl ProcessSummary {
    pub fn executed(&self) -> usize {
        self.done.len() + self.failed.len()
    }
}

/// Per-bundle mutexes shared by everything on this node that writes bundle
/// state: the processor holds a bundle's lock from claim to write-back, and
/// the reconciler takes it before touching that bundle's node entry.
#[derive(Debug, Clone, Default)]
pub struct BundleLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl BundleLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bundle: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(bundle.to_string()).or_default().clone()
    }
}

enum Outcome {
    Recorded(Operation),
    LostClaim,
    Unrecorded,
}

#[derive(Debug, Clone)]
pub struct OperationProcessor {
    node_id: String,
    repository: ModuleRepository,
    runtime: Arc<dyn PackageRuntime>,
    settings: ProcessorSettings,
    bundle_locks: BundleLocks,
}

impl OperationProcessor {
    pub fn new(
        node_id: impl Into<String>,
        repository: ModuleRepository,
        runtime: Arc<dyn PackageRuntime>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            repository,
            runtime,
            settings,
            bundle_locks: BundleLocks::new(),
        }
    }

    /// Share bundle locks with other writers on this node.
    pub fn with_bundle_locks(mut self, bundle_locks: BundleLocks) -> Self {
        self.bundle_locks = bundle_locks;
        self
    }

    pub fn bundle_locks(&self) -> &BundleLocks {
        &self.bundle_locks
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Run every claimable record of this node until the queue stops moving.
    ///
    /// Only a failure to list the queue is returned; failures of individual
    /// records end up on the records themselves or in the log.
    pub fn process(&self) -> Result<ProcessSummary, ModuleError> {
        let mut summary = ProcessSummary::default();
        while self.run_pass(&mut summary)? {}
        if summary.executed() > 0 {
            info!(
                node = %self.node_id,
                done = summary.done.len(),
                failed = summary.failed.len(),
                "Processed operations"
            );
        }
        Ok(summary)
    }

    /// One walk over the queue. Returns whether any record reached a
    /// terminal state.
    fn run_pass(&self, summary: &mut ProcessSummary) -> Result<bool, ModuleError> {
        let operations = self
            .settings
            .retry
            .run("list operations", || self.repository.operations(&self.node_id))?;
        let now = Utc::now();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut progressed = false;

        for operation in operations {
            if operation.state().is_terminal() {
                continue;
            }
            if !blocked.insert(operation.bundle().to_string()) {
                debug!(
                    operation = operation.name().unwrap_or_default(),
                    bundle = %operation.bundle(),
                    "Waiting for an earlier operation on the same bundle"
                );
                continue;
            }
            if !operation.is_claimable(now, self.settings.stale_after) {
                continue;
            }
            match self.execute(operation) {
                Outcome::Recorded(finished) => {
                    let name = finished.name().unwrap_or_default().to_string();
                    if finished.state() == OperationState::Failed {
                        summary.failed.push(name);
                    } else {
                        summary.done.push(name);
                    }
                    progressed = true;
                }
                Outcome::LostClaim => summary.lost_claims += 1,
                Outcome::Unrecorded => summary.unrecorded += 1,
            }
        }
        Ok(progressed)
    }

    fn execute(&self, operation: Operation) -> Outcome {
        let lock = self.bundle_locks.get(operation.bundle());
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let name = operation.name().unwrap_or_default().to_string();
        let mut claim = operation;
        claim.mark_processing(Utc::now());
        let claimed = match self
            .settings
            .retry
            .run("claim operation", || self.repository.replace_operation(&claim))
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(operation = %name, "Operation claimed by another worker");
                return Outcome::LostClaim;
            }
            Err(err) => {
                warn!(operation = %name, error = %err, "Failed to claim operation");
                return Outcome::LostClaim;
            }
        };

        info!(
            operation = %name,
            action = %claimed.action(),
            bundle = %claimed.bundle(),
            "Executing operation"
        );
        let mut finished = claimed.clone();
        match self.dispatch(&claimed) {
            Ok(()) => finished.mark_done(Utc::now()),
            Err(err) => {
                warn!(operation = %name, error = %err, "Operation failed");
                finished.mark_failed(err.reason(), Utc::now());
            }
        }

        match self
            .settings
            .retry
            .run("record outcome", || self.repository.replace_operation(&finished))
        {
            Ok(Some(stored)) => Outcome::Recorded(stored),
            Ok(None) => {
                warn!(operation = %name, "Operation was taken over while running, outcome discarded");
                Outcome::Unrecorded
            }
            Err(err) => {
                error!(
                    operation = %name,
                    error = %err,
                    "Failed to record outcome, the claim will be retried once stale"
                );
                Outcome::Unrecorded
            }
        }
    }

    fn dispatch(&self, operation: &Operation) -> Result<(), ModuleError> {
        match operation.action() {
            OperationAction::Install => self.install(operation.bundle()),
            OperationAction::Uninstall => self.uninstall(operation.bundle()),
            OperationAction::Start => self.transition(operation.bundle(), OperationAction::Start),
            OperationAction::Stop => self.transition(operation.bundle(), OperationAction::Stop),
        }
    }

    fn install(&self, name: &str) -> Result<(), ModuleError> {
        let bundle = self
            .store_call("read catalog", || self.repository.bundle(name))?
            .ok_or_else(|| {
                ModuleError::ManagementFailure(format!("Bundle {} is not in the catalog", name))
            })?;
        let file = bundle.file().ok_or_else(|| {
            ModuleError::ManagementFailure(format!("Bundle {} has no content", name))
        })?;
        if let (Some(path), Some(expected)) = (file.to_file_path(), bundle.checksum()) {
            let actual = checksum_file(&path).map_err(|err| {
                ModuleError::ManagementFailure(format!("Failed to read {}: {:#}", path.display(), err))
            })?;
            if actual != expected {
                return Err(ModuleError::ManagementFailure(format!(
                    "Content of {} does not match its checksum",
                    path.display()
                )));
            }
        }

        let id = self.runtime.install(file).map_err(management_failure)?;
        if self.settings.auto_start {
            self.runtime.start(id).map_err(management_failure)?;
        }
        let state = self.runtime.state(id).map_err(management_failure)?;
        let node_bundle = NodeBundle::new(&bundle).with_state(state.to_lowercase());
        self.store_call("write node bundle", || {
            self.repository.put_node_bundle(&self.node_id, &node_bundle)
        })?;
        debug!(bundle = %name, id, "Bundle installed");
        Ok(())
    }

    fn uninstall(&self, name: &str) -> Result<(), ModuleError> {
        let package = self.loaded(name)?;
        self.runtime
            .uninstall(package.id)
            .map_err(management_failure)?;
        self.store_call("remove node bundle", || {
            self.repository.remove_node_bundle(&self.node_id, name)
        })?;
        debug!(bundle = %name, id = package.id, "Bundle uninstalled");
        Ok(())
    }

    fn transition(&self, name: &str, action: OperationAction) -> Result<(), ModuleError> {
        let package = self.loaded(name)?;
        let applied = match action {
            OperationAction::Start => self.runtime.start(package.id),
            OperationAction::Stop => self.runtime.stop(package.id),
            OperationAction::Install | OperationAction::Uninstall => {
                return Err(ModuleError::InvalidRequest(format!(
                    "{} is not a state transition",
                    action
                )));
            }
        };
        applied.map_err(management_failure)?;

        let state = self.runtime.state(package.id).map_err(management_failure)?;
        let bundle = match self.store_call("read catalog", || self.repository.bundle(name))? {
            Some(bundle) => bundle,
            None => bundle_from_package(&package, name),
        };
        let node_bundle = NodeBundle::new(&bundle).with_state(state.to_lowercase());
        self.store_call("write node bundle", || {
            self.repository.put_node_bundle(&self.node_id, &node_bundle)
        })?;
        Ok(())
    }

    fn loaded(&self, name: &str) -> Result<LoadedPackage, ModuleError> {
        find_by_name(self.runtime.as_ref(), name)
            .map_err(management_failure)?
            .ok_or_else(|| {
                ModuleError::BundleNotFound(format!("{} is not loaded on {}", name, self.node_id))
            })
    }

    /// Delete terminal records that finished more than `retention` ago.
    /// Returns how many were removed.
    pub fn compact(&self, retention: chrono::Duration) -> Result<usize, ModuleError> {
        let cutoff = Utc::now() - retention;
        let mut removed = 0;
        for operation in self
            .settings
            .retry
            .run("list operations", || self.repository.operations(&self.node_id))?
        {
            if !operation.state().is_terminal() {
                continue;
            }
            let finished_at = operation.finished_at().unwrap_or(operation.created_at());
            if finished_at > cutoff {
                continue;
            }
            if self.store_call("remove operation", || self.repository.remove_operation(&operation))? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(node = %self.node_id, removed, "Compacted operation history");
        }
        Ok(removed)
    }

    fn store_call<T>(
        &self,
        what: &str,
        f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, ModuleError> {
        Ok(self.settings.retry.run(what, f)?)
    }
}

fn management_failure(err: anyhow::Error) -> ModuleError {
    ModuleError::ManagementFailure(format!("{:#}", err))
}

/// Catalog stand-in for a package loaded outside the coordinator.
fn bundle_from_package(package: &LoadedPackage, name: &str) -> Bundle {
    match (package.manifest.symbolic_name(), package.manifest.version()) {
        (Some(symbolic_name), Some(version)) => Bundle::new(symbolic_name, version)
            .with_display_name(package.manifest.display_name().map(str::to_string)),
        _ => Bundle::new(name, ""),
    }
}
