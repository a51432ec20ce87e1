//! Operation records: the unit of work addressed to one cluster node.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModuleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    Install,
    Uninstall,
    Start,
    Stop,
}

impl OperationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationAction::Install => "install",
            OperationAction::Uninstall => "uninstall",
            OperationAction::Start => "start",
            OperationAction::Stop => "stop",
        }
    }
}

impl FromStr for OperationAction {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(OperationAction::Install),
            "uninstall" => Ok(OperationAction::Uninstall),
            "start" => Ok(OperationAction::Start),
            "stop" => Ok(OperationAction::Stop),
            other => Err(ModuleError::InvalidRequest(format!(
                "Unknown operation action '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for OperationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OperationState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Processing => "processing",
            OperationState::Done => "done",
            OperationState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Done | OperationState::Failed)
    }
}

impl FromStr for OperationState {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationState::Pending),
            "processing" => Ok(OperationState::Processing),
            "done" => Ok(OperationState::Done),
            "failed" => Ok(OperationState::Failed),
            other => Err(ModuleError::InvalidRequest(format!(
                "Unknown operation state '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable request to apply `action` to `bundle` on `node`.
///
/// The (action, bundle, node) triple is fixed at construction. Only the
/// lifecycle state and its bookkeeping change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    action: OperationAction,
    bundle: String,
    node: String,
    name: Option<String>,
    path: Option<String>,
    state: OperationState,
    reason: Option<String>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    revision: u64,
}

impl Operation {
    pub fn new(action: OperationAction, bundle: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            action,
            bundle: bundle.into(),
            node: node.into(),
            name: None,
            path: None,
            state: OperationState::Pending,
            reason: None,
            created_at: Utc::now(),
            claimed_at: None,
            finished_at: None,
            revision: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach the storage location and the revision it was read at.
    pub fn stored_at(mut self, path: impl Into<String>, revision: u64) -> Self {
        self.path = Some(path.into());
        self.revision = revision;
        self
    }

    pub fn action(&self) -> OperationAction {
        self.action
    }

    /// Composite name of the target bundle.
    pub fn bundle(&self) -> &str {
        &self.bundle
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Explicit name when set, otherwise the last segment of the storage
    /// path. Records are identified by path first, so the fallback matters
    /// for anything read back from the store without a name property.
    pub fn name(&self) -> Option<&str> {
        if let Some(name) = self.name.as_deref() {
            return Some(name);
        }
        self.path
            .as_deref()
            .and_then(|path| path.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
    }

    pub fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn claimed_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a worker may claim this record at `now`.
    ///
    /// Pending records always are; processing records only once their claim
    /// is older than `stale_after`.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        match self.state {
            OperationState::Pending => true,
            OperationState::Processing => match self.claimed_at {
                Some(claimed_at) => now - claimed_at >= stale_after,
                None => true,
            },
            OperationState::Done | OperationState::Failed => false,
        }
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.state = OperationState::Processing;
        self.claimed_at = Some(now);
        self.reason = None;
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.state = OperationState::Done;
        self.finished_at = Some(now);
        self.reason = None;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.state = OperationState::Failed;
        self.finished_at = Some(now);
        self.reason = Some(reason.into());
    }

    /// Restore bookkeeping fields read back from the store.
    pub(crate) fn restore(
        mut self,
        state: OperationState,
        reason: Option<String>,
        claimed_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.state = state;
        self.reason = reason;
        self.claimed_at = claimed_at;
        self.finished_at = finished_at;
        self
    }
}
