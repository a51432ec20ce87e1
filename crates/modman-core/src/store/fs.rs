//! Durable tree store on a (possibly shared) filesystem.
//!
//! Layout: every tree node is a directory holding a `.node.json` document
//! (`props`, `revision`, `created`); the store-wide revision counter lives in
//! `<root>/.revision`. Documents are written to a temp file and renamed into
//! place. Writers serialize through an in-process mutex plus an exclusive
//! advisory lock on `<root>/.store.lock`, so several processes may share one
//! root. The operating system drops the advisory lock when its holder exits,
//! so a crashed writer never leaves the store locked.
//!
//! Notifications are delivered to subscribers in this process only; nodes
//! running elsewhere discover new records through their periodic sweep.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{EventHub, EventKind, StoreError, StoreNode, Subscription, TreeStore, normalize_path};

const NODE_FILE: &str = ".node.json";
const REVISION_FILE: &str = ".revision";
const LOCK_FILE: &str = ".store.lock";

/// How long to keep retrying for the cross-process lock.
const LOCK_ATTEMPTS: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Serialize, Deserialize)]
struct NodeDocument {
    props: Value,
    revision: u64,
    created: u64,
}

#[derive(Debug)]
pub struct FsTreeStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    events: EventHub,
}

impl FsTreeStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            events: EventHub::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, path: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            dir.push(segment);
        }
        dir
    }

    fn read_document(&self, dir: &Path) -> Result<Option<NodeDocument>, StoreError> {
        let file = dir.join(NODE_FILE);
        let bytes = match fs::read(&file) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path: file, source }),
        };
        let doc = serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Corrupt { path: file, source })?;
        Ok(Some(doc))
    }

    fn write_document(&self, dir: &Path, doc: &NodeDocument) -> Result<(), StoreError> {
        fs::create_dir_all(dir).map_err(|source| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| StoreError::Corrupt {
            path: dir.join(NODE_FILE),
            source,
        })?;
        write_atomic(&dir.join(NODE_FILE), &bytes)
    }

    fn next_revision(&self) -> Result<u64, StoreError> {
        let file = self.root.join(REVISION_FILE);
        let current = match fs::read_to_string(&file) {
            // Revisions must never repeat: a damaged counter stops all writes.
            Ok(text) => text.trim().parse::<u64>().map_err(|_| {
                warn!(path = %file.display(), "Unreadable revision counter");
                StoreError::CorruptRevision {
                    path: file.clone(),
                    value: text.trim().to_string(),
                }
            })?,
            Err(err) if err.kind() == IoErrorKind::NotFound => 0,
            Err(source) => return Err(StoreError::Io { path: file, source }),
        };
        let next = current + 1;
        write_atomic(&file, next.to_string().as_bytes())?;
        Ok(next)
    }

    /// Run `f` while holding both the in-process and the cross-process lock.
    fn with_write_lock<T>(
        &self,
        path: &str,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Unavailable("fs store lock poisoned".to_string()))?;
        let _file_lock = FileLock::acquire(&self.root.join(LOCK_FILE), path)?;
        f()
    }

    fn write_node(&self, path: &str, props: Value, must_not_exist: bool) -> Result<StoreNode, StoreError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath {
                path,
                reason: "the root node cannot be written",
            });
        }
        let (node, events) = self.with_write_lock(&path, || {
            let dir = self.dir_for(&path);
            let existing = self.read_document(&dir)?;
            if existing.is_some() && must_not_exist {
                return Err(StoreError::AlreadyExists(path.clone()));
            }
            let mut events = self.ensure_ancestors(&path)?;
            let revision = self.next_revision()?;
            let created = existing.as_ref().map(|d| d.created).unwrap_or(revision);
            self.write_document(
                &dir,
                &NodeDocument {
                    props: props.clone(),
                    revision,
                    created,
                },
            )?;
            let kind = if existing.is_some() {
                EventKind::Updated
            } else {
                EventKind::Created
            };
            events.push((kind, path.clone(), revision));
            Ok((
                StoreNode {
                    path: path.clone(),
                    props,
                    revision,
                    created,
                },
                events,
            ))
        })?;
        for (kind, path, revision) in events {
            self.events.publish(kind, &path, revision);
        }
        Ok(node)
    }

    fn ensure_ancestors(&self, path: &str) -> Result<Vec<(EventKind, String, u64)>, StoreError> {
        let mut missing = Vec::new();
        let mut current = super::parent(path);
        while let Some(p) = current {
            if p == "/" || self.read_document(&self.dir_for(p))?.is_some() {
                break;
            }
            missing.push(p.to_string());
            current = super::parent(p);
        }
        let mut created = Vec::with_capacity(missing.len());
        for p in missing.into_iter().rev() {
            let revision = self.next_revision()?;
            self.write_document(
                &self.dir_for(&p),
                &NodeDocument {
                    props: Value::Object(Default::default()),
                    revision,
                    created: revision,
                },
            )?;
            created.push((EventKind::Created, p, revision));
        }
        Ok(created)
    }

    fn to_node(path: String, doc: NodeDocument) -> StoreNode {
        StoreNode {
            path,
            props: doc.props,
            revision: doc.revision,
            created: doc.created,
        }
    }
}

impl TreeStore for FsTreeStore {
    fn get(&self, path: &str) -> Result<Option<StoreNode>, StoreError> {
        let path = normalize_path(path)?;
        let doc = self.read_document(&self.dir_for(&path))?;
        Ok(doc.map(|doc| Self::to_node(path, doc)))
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
        let node = self.with_write_lock(&path, || {
            let dir = self.dir_for(&path);
            let Some(existing) = self.read_document(&dir)? else {
                return Err(StoreError::NotFound(path.clone()));
            };
            if existing.revision != expected_revision {
                debug!(path = %path, expected_revision, actual = existing.revision, "CAS lost");
                return Ok(None);
            }
            let revision = self.next_revision()?;
            let doc = NodeDocument {
                props,
                revision,
                created: existing.created,
            };
            self.write_document(&dir, &doc)?;
            Ok(Some(Self::to_node(path.clone(), doc)))
        })?;
        if let Some(node) = &node {
            self.events
                .publish(EventKind::Updated, &node.path, node.revision);
        }
        Ok(node)
    }

    fn remove(&self, path: &str) -> Result<bool, StoreError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(StoreError::InvalidPath {
                path,
                reason: "the root node cannot be removed",
            });
        }
        let removed = self.with_write_lock(&path, || {
            let dir = self.dir_for(&path);
            if self.read_document(&dir)?.is_none() {
                return Ok(None);
            }
            fs::remove_dir_all(&dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            Ok(Some(self.next_revision()?))
        })?;
        match removed {
            Some(revision) => {
                self.events.publish(EventKind::Removed, &path, revision);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn children(&self, path: &str) -> Result<Vec<StoreNode>, StoreError> {
        let path = normalize_path(path)?;
        let dir = self.dir_for(&path);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            // A directory without a document is a write that never completed.
            if let Some(doc) = self.read_document(&entry.path())? {
                children.push(Self::to_node(super::join(&path, &name), doc));
            }
        }
        children.sort_by_key(|node| node.created);
        Ok(children)
    }

    fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError> {
        self.events.subscribe(prefix)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!("{}.tmp-{}", file_name, std::process::id()));
    fs::write(&tmp_path, bytes).map_err(|source| StoreError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Exclusive advisory lock on the store lock file, held until drop.
///
/// The file itself is never removed: ownership lives in the lock, not in the
/// file's existence.
#[derive(Debug)]
struct FileLock {
    _file: fs::File,
}

impl FileLock {
    fn acquire(path: &Path, target: &str) -> Result<Self, StoreError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        for _ in 0..LOCK_ATTEMPTS {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { _file: file }),
                Err(err) if is_contended(&err) => std::thread::sleep(LOCK_RETRY_DELAY),
                Err(source) => {
                    return Err(StoreError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }
        debug!(path = %path.display(), target, "Store lock still held by another writer");
        Err(StoreError::Contended(target.to_string()))
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    if err.kind() == IoErrorKind::WouldBlock {
        return true;
    }
    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    cfg!(windows) && matches!(err.raw_os_error(), Some(32 | 33))
}
