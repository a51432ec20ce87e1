//! Hierarchical store shared by every cluster node.
//!
//! Nodes are addressed by slash-separated paths (`/a/b/c`) and hold a JSON
//! property document. Every write bumps a store-wide revision; nodes remember
//! the revision that created them and the one that last modified them, which
//! gives creation order for listings and compare-and-set for claims.
//! Subscribers receive change notifications scoped to a path prefix.

pub mod fs;
pub mod memory;
pub mod repository;
pub mod schema;

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::broadcast;

pub use fs::FsTreeStore;
pub use memory::MemoryTreeStore;
pub use repository::ModuleRepository;

/// Capacity of the notification channel before slow subscribers lag.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid store path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt node document at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unreadable revision counter at {path}: {value:?}")]
    CorruptRevision { path: PathBuf, value: String },

    #[error("Node is locked by another writer: {0}")]
    Contended(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected property document at {path}: {reason}")]
    Schema { path: String, reason: String },
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Io { .. } | StoreError::Contended(_) | StoreError::Unavailable(_)
        )
    }
}

/// A node read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreNode {
    pub path: String,
    pub props: Value,
    /// Revision of the last write to this node.
    pub revision: u64,
    /// Revision of the write that created this node.
    pub created: u64,
}

impl StoreNode {
    /// Last segment of the node path.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub path: String,
    pub revision: u64,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Event(StoreEvent),
    /// The subscriber fell behind and `n` events were dropped.
    Lagged(u64),
}

/// Change notifications for one path prefix.
#[derive(Debug)]
pub struct Subscription {
    prefix: String,
    rx: broadcast::Receiver<StoreEvent>,
}

impl Subscription {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next notification under the prefix, `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(event) if is_within(&event.path, &self.prefix) => {
                    return Some(Notification::Event(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Notification::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Durable tree store with change notification and conditional updates.
pub trait TreeStore: Send + Sync + std::fmt::Debug {
    fn get(&self, path: &str) -> Result<Option<StoreNode>, StoreError>;

    /// Create a node, failing with `AlreadyExists` if it is present.
    /// Missing ancestors are created with empty properties.
    fn create(&self, path: &str, props: Value) -> Result<StoreNode, StoreError>;

    /// Create or overwrite a node.
    fn put(&self, path: &str, props: Value) -> Result<StoreNode, StoreError>;

    /// Overwrite a node only if its revision is still `expected_revision`.
    /// Returns `None` when another writer got there first.
    fn compare_and_set(
        &self,
        path: &str,
        expected_revision: u64,
        props: Value,
    ) -> Result<Option<StoreNode>, StoreError>;

    /// Remove a node and its subtree. Returns whether anything was removed.
    fn remove(&self, path: &str) -> Result<bool, StoreError>;

    /// Direct children of `path`, oldest first.
    fn children(&self, path: &str) -> Result<Vec<StoreNode>, StoreError>;

    fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError>;
}

/// Broadcast side of store notifications.
#[derive(Debug, Clone)]
pub(crate) struct EventHub {
    tx: broadcast::Sender<StoreEvent>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn publish(&self, kind: EventKind, path: &str, revision: u64) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.tx.send(StoreEvent {
            kind,
            path: path.to_string(),
            revision,
        });
    }

    pub(crate) fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError> {
        Ok(Subscription {
            prefix: normalize_path(prefix)?,
            rx: self.tx.subscribe(),
        })
    }
}

/// Validate and canonicalise a store path: leading slash, no trailing slash,
/// no empty, dot or hidden segments.
pub fn normalize_path(path: &str) -> Result<String, StoreError> {
    let trimmed = path.trim();
    if !trimmed.starts_with('/') {
        return Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason: "must start with '/'",
        });
    }
    let mut normalized = String::with_capacity(trimmed.len());
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        validate_segment(segment).map_err(|reason| StoreError::InvalidPath {
            path: path.to_string(),
            reason,
        })?;
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Check that a single segment can be used as a path component.
pub fn validate_segment(segment: &str) -> Result<(), &'static str> {
    if segment.is_empty() {
        return Err("empty segment");
    }
    if segment.starts_with('.') {
        return Err("segments must not start with '.'");
    }
    if segment
        .chars()
        .any(|c| c == '/' || c == '\\' || c == ':' || c.is_control())
    {
        return Err("segment contains a reserved character");
    }
    Ok(())
}

/// Join a normalized parent path and a segment.
pub fn join(parent: &str, segment: &str) -> String {
    if parent == "/" {
        format!("/{}", segment)
    } else {
        format!("{}/{}", parent, segment)
    }
}

/// Parent of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Whether `path` is `prefix` itself or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_slashes() {
        assert_eq!(normalize_path("/a//b/").ok().as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("/").ok().as_deref(), Some("/"));
    }

    #[test]
    fn test_normalize_rejects_relative_and_dot_segments() {
        assert!(normalize_path("a/b").is_err());
        assert!(normalize_path("/a/../b").is_err());
        assert!(normalize_path("/a/.hidden").is_err());
    }

    #[test]
    fn test_prefix_matching_respects_segment_boundaries() {
        assert!(is_within("/a/b/c", "/a/b"));
        assert!(is_within("/a/b", "/a/b"));
        assert!(!is_within("/a/bc", "/a/b"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_parent_of_paths() {
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
    }
}
