#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use modman_core::config::NodeConfig;
use modman_core::context::NodeContext;
use modman_core::runtime::LocalRuntime;
use modman_core::staging::DirectoryStager;
use modman_core::store::{MemoryTreeStore, TreeStore};
use zip::write::SimpleFileOptions;

/// Bytes of a bundle archive whose manifest names `symbolic` / `version`.
/// Managed bundles also carry the `Module-Type` marker header.
pub fn bundle_archive(symbolic: &str, version: &str, managed: bool) -> Vec<u8> {
    let mut manifest = format!(
        "Manifest-Version: 1.0\r\nBundle-SymbolicName: {}\r\nBundle-Version: {}\r\nBundle-Name: {} bundle\r\n",
        symbolic, version, symbolic
    );
    if managed {
        manifest.push_str("Module-Type: service\r\n");
    }
    manifest.push_str("\r\n");

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("META-INF/MANIFEST.MF", SimpleFileOptions::default())
        .expect("zip entry should start");
    writer
        .write_all(manifest.as_bytes())
        .expect("manifest should be written");
    writer
        .start_file("com/example/Main.class", SimpleFileOptions::default())
        .expect("zip entry should start");
    writer
        .write_all(format!("{}-{}", symbolic, version).as_bytes())
        .expect("payload should be written");
    writer.finish().expect("zip should finish").into_inner()
}

/// Write a bundle archive to `dir/file_name` and return its path.
pub fn write_bundle(dir: &Path, file_name: &str, symbolic: &str, version: &str) -> PathBuf {
    std::fs::create_dir_all(dir).expect("bundle dir should be created");
    let path = dir.join(file_name);
    std::fs::write(&path, bundle_archive(symbolic, version, true))
        .expect("bundle should be written");
    path
}

/// Nodes sharing one in-memory store and one staging area, each with its
/// own runtime cache.
pub struct Cluster {
    pub root: tempfile::TempDir,
    pub store: Arc<dyn TreeStore>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            root: tempfile::TempDir::new().expect("tempdir should succeed"),
            store: Arc::new(MemoryTreeStore::new()),
        }
    }

    pub fn config(&self, node_id: &str) -> NodeConfig {
        let node_dir = self.root.path().join(node_id);
        NodeConfig {
            node_id: node_id.to_string(),
            store_dir: self.root.path().join("store"),
            runtime_dir: node_dir.join("runtime"),
            staging_dir: self.root.path().join("staging"),
            retry_attempts: 1,
            retry_base_delay_ms: 0,
            ..NodeConfig::default()
        }
    }

    pub fn node(&self, node_id: &str) -> NodeContext {
        let config = self.config(node_id);
        let runtime = LocalRuntime::open(&config.runtime_dir).expect("runtime should open");
        let stager = DirectoryStager::new(&config.staging_dir);
        let context =
            NodeContext::from_parts(config, self.store.clone(), Arc::new(runtime), Arc::new(stager));
        context
            .coordinator()
            .register_node(node_id)
            .expect("node should register");
        context
    }
}

pub fn nodes(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}
