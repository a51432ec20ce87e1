//! In-process tree store.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;

use super::{
    EventHub, EventKind, StoreError, StoreNode, Subscription, TreeStore, is_within,
    normalize_path, parent,
};

#[derive(Debug, Clone)]
struct Entry {
    props: Value,
    revision: u64,
    created: u64,
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<String, Entry>,
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Create missing ancestors of `path`, returning the created paths.
    fn ensure_ancestors(&mut self, path: &str) -> Vec<(String, u64)> {
        let mut missing = Vec::new();
        let mut current = parent(path);
        while let Some(p) = current {
            if p == "/" || self.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            current = parent(p);
        }
        let mut created = Vec::with_capacity(missing.len());
        for p in missing.into_iter().rev() {
            let revision = self.next_revision();
            self.nodes.insert(
                p.clone(),
                Entry {
                    props: Value::Object(Default::default()),
                    revision,
                    created: revision,
                },
            );
            created.push((p, revision));
        }
        created
    }
}

/// Tree store kept in memory. Shares notifications only within the process.
#[derive(Debug)]
pub struct MemoryTreeStore {
    inner: RwLock<Inner>,
    events: EventHub,
}

impl MemoryTreeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events: EventHub::new(),
        }
    }

    fn write_node(&self, path: &str, props: Value, must_not_exist: bool) -> Result<StoreNode, StoreError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath {
                path,
                reason: "the root node cannot be written",
            });
        }
        let (node, ancestors, kind) = {
            let mut inner = self.inner.write().map_err(|_| poisoned())?;
            let existing = inner.nodes.get(&path).map(|e| e.created);
            if existing.is_some() && must_not_exist {
                return Err(StoreError::AlreadyExists(path));
            }
            let ancestors = inner.ensure_ancestors(&path);
            let revision = inner.next_revision();
            let created = existing.unwrap_or(revision);
            inner.nodes.insert(
                path.clone(),
                Entry {
                    props: props.clone(),
                    revision,
                    created,
                },
            );
            let kind = if existing.is_some() {
                EventKind::Updated
            } else {
                EventKind::Created
            };
            (
                StoreNode {
                    path: path.clone(),
                    props,
                    revision,
                    created,
                },
                ancestors,
                kind,
            )
        };
        for (ancestor, revision) in ancestors {
            self.events.publish(EventKind::Created, &ancestor, revision);
        }
        self.events.publish(kind, &node.path, node.revision);
        Ok(node)
    }
}

impl Default for MemoryTreeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore for MemoryTreeStore {
    fn get(&self, path: &str) -> Result<Option<StoreNode>, StoreError> {
        let path = normalize_path(path)?;
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.nodes.get(&path).map(|entry| StoreNode {
            path: path.clone(),
            props: entry.props.clone(),
            revision: entry.revision,
            created: entry.created,
        }))
    }

    fn create(&self, path: &str, props: Value) -> Result<StoreNode, StoreError> {
        self.write_node(path, props, true)
    }

    fn put(&self, path: &str, props: Value) -> Result<StoreNode, StoreError> {
        self.write_node(path, props, false)
    }

    fn compare_and_set(
        &self,
        path: &str,
        expected_revision: u64,
        props: Value,
    ) -> Result<Option<StoreNode>, StoreError> {
        let path = normalize_path(path)?;
        let node = {
            let mut inner = self.inner.write().map_err(|_| poisoned())?;
            let (current, created) = match inner.nodes.get(&path) {
                Some(entry) => (entry.revision, entry.created),
                None => return Err(StoreError::NotFound(path)),
            };
            if current != expected_revision {
                return Ok(None);
            }
            let revision = inner.next_revision();
            inner.nodes.insert(
                path.clone(),
                Entry {
                    props: props.clone(),
                    revision,
                    created,
                },
            );
            StoreNode {
                path,
                props,
                revision,
                created,
            }
        };
        self.events
            .publish(EventKind::Updated, &node.path, node.revision);
        Ok(Some(node))
    }

    fn remove(&self, path: &str) -> Result<bool, StoreError> {
        let path = normalize_path(path)?;
        let revision = {
            let mut inner = self.inner.write().map_err(|_| poisoned())?;
            if !inner.nodes.contains_key(&path) {
                return Ok(false);
            }
            inner.nodes.retain(|p, _| !is_within(p, &path));
            inner.next_revision()
        };
        self.events.publish(EventKind::Removed, &path, revision);
        Ok(true)
    }

    fn children(&self, path: &str) -> Result<Vec<StoreNode>, StoreError> {
        let path = normalize_path(path)?;
        let inner = self.inner.read().map_err(|_| poisoned())?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut children: Vec<StoreNode> = inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, entry)| StoreNode {
                path: p.clone(),
                props: entry.props.clone(),
                revision: entry.revision,
                created: entry.created,
            })
            .collect();
        children.sort_by_key(|node| node.created);
        Ok(children)
    }

    fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError> {
        self.events.subscribe(prefix)
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}
