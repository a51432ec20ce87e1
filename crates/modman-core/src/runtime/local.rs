//! Directory-backed package runtime.
//!
//! Each installed package gets a cache entry `bundle{id}/` holding the
//! archive (`bundle.jar`) and a small `package.json` with its install
//! location and lifecycle state. The runtime only tracks lifecycle; it does
//! not execute package code.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::BinaryFile;

use super::manifest::Manifest;
use super::{LoadedPackage, PackageRuntime, STATE_ACTIVE, STATE_INSTALLED, STATE_RESOLVED};

const ARCHIVE_FILE: &str = "bundle.jar";
const RECORD_FILE: &str = "package.json";
const ENTRY_PREFIX: &str = "bundle";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackageRecord {
    location: String,
    state: String,
}

#[derive(Debug, Clone)]
struct Entry {
    record: PackageRecord,
    manifest: Manifest,
}

#[derive(Debug)]
pub struct LocalRuntime {
    cache_dir: PathBuf,
    entries: Mutex<BTreeMap<u64, Entry>>,
}

impl LocalRuntime {
    /// Open the runtime cache at `cache_dir`, loading existing entries.
    /// Entries that cannot be read are skipped with a warning.
    pub fn open(cache_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).with_context(|| {
            format!("Failed to create runtime cache: {}", cache_dir.display())
        })?;

        let mut entries = BTreeMap::new();
        for dir_entry in fs::read_dir(&cache_dir)
            .with_context(|| format!("Failed to read runtime cache: {}", cache_dir.display()))?
        {
            let dir_entry = dir_entry?;
            let Some(id) = parse_entry_id(&dir_entry.file_name().to_string_lossy()) else {
                continue;
            };
            match load_entry(&dir_entry.path()) {
                Ok(entry) => {
                    entries.insert(id, entry);
                }
                Err(err) => warn!(id, error = %format!("{:#}", err), "Skipping unreadable package cache entry"),
            }
        }
        debug!(packages = entries.len(), cache = %cache_dir.display(), "Runtime cache loaded");

        Ok(Self {
            cache_dir,
            entries: Mutex::new(entries),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_dir(&self, id: u64) -> PathBuf {
        self.cache_dir.join(format!("{}{}", ENTRY_PREFIX, id))
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, BTreeMap<u64, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow::anyhow!("Runtime cache lock poisoned"))
    }

    fn set_state(&self, id: u64, state: &str) -> anyhow::Result<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("Package {} is not installed", id))?;
        if entry.record.state == state {
            return Ok(());
        }
        entry.record.state = state.to_string();
        write_record(&self.entry_dir(id), &entry.record)?;
        info!(id, state, "Package state changed");
        Ok(())
    }
}

impl PackageRuntime for LocalRuntime {
    fn install(&self, file: &BinaryFile) -> anyhow::Result<u64> {
        let source = file
            .to_file_path()
            .ok_or_else(|| anyhow::anyhow!("Unsupported package location: {}", file.url))?;
        let manifest = Manifest::from_archive(&source)?;
        let name = manifest.composite_name().ok_or_else(|| {
            anyhow::anyhow!(
                "Archive {} has no symbolic name or version",
                source.display()
            )
        })?;

        let mut entries = self.lock()?;
        let existing = entries
            .iter()
            .find(|(_, entry)| entry.manifest.composite_name().as_deref() == Some(name.as_str()))
            .map(|(id, _)| *id);
        let id = match existing {
            Some(id) => id,
            None => entries.keys().next_back().map(|id| id + 1).unwrap_or(1),
        };

        let dir = self.entry_dir(id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache entry: {}", dir.display()))?;
        fs::copy(&source, dir.join(ARCHIVE_FILE)).with_context(|| {
            format!(
                "Failed to copy {} into cache entry {}",
                source.display(),
                dir.display()
            )
        })?;

        let state = existing
            .and_then(|id| entries.get(&id))
            .map(|entry| entry.record.state.clone())
            .unwrap_or_else(|| STATE_INSTALLED.to_string());
        let record = PackageRecord {
            location: file.url.to_string(),
            state,
        };
        write_record(&dir, &record)?;
        entries.insert(id, Entry { record, manifest });

        if existing.is_some() {
            info!(id, bundle = %name, "Package updated in place");
        } else {
            info!(id, bundle = %name, "Package installed");
        }
        Ok(id)
    }

    fn uninstall(&self, id: u64) -> anyhow::Result<()> {
        let mut entries = self.lock()?;
        if entries.remove(&id).is_none() {
            anyhow::bail!("Package {} is not installed", id);
        }
        let dir = self.entry_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove cache entry: {}", dir.display()))?;
        }
        info!(id, "Package uninstalled");
        Ok(())
    }

    fn start(&self, id: u64) -> anyhow::Result<()> {
        self.set_state(id, STATE_ACTIVE)
    }

    fn stop(&self, id: u64) -> anyhow::Result<()> {
        self.set_state(id, STATE_RESOLVED)
    }

    fn packages(&self) -> anyhow::Result<Vec<LoadedPackage>> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .map(|(id, entry)| LoadedPackage {
                id: *id,
                location: entry.record.location.clone(),
                manifest: entry.manifest.clone(),
            })
            .collect())
    }

    fn archive_path(&self, id: u64) -> anyhow::Result<Option<PathBuf>> {
        if !self.lock()?.contains_key(&id) {
            anyhow::bail!("No cache entry for package {}", id);
        }
        let archive = self.entry_dir(id).join(ARCHIVE_FILE);
        Ok(archive.is_file().then_some(archive))
    }

    fn state(&self, id: u64) -> anyhow::Result<String> {
        self.lock()?
            .get(&id)
            .map(|entry| entry.record.state.clone())
            .ok_or_else(|| anyhow::anyhow!("Package {} is not installed", id))
    }
}

fn parse_entry_id(name: &str) -> Option<u64> {
    name.strip_prefix(ENTRY_PREFIX)?.parse().ok()
}

fn load_entry(dir: &Path) -> anyhow::Result<Entry> {
    let record_path = dir.join(RECORD_FILE);
    let bytes = fs::read(&record_path)
        .with_context(|| format!("Failed to read {}", record_path.display()))?;
    let record: PackageRecord = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", record_path.display()))?;
    let manifest = Manifest::from_archive(&dir.join(ARCHIVE_FILE))?;
    Ok(Entry { record, manifest })
}

fn write_record(dir: &Path, record: &PackageRecord) -> anyhow::Result<()> {
    let path = dir.join(RECORD_FILE);
    let bytes = serde_json::to_vec_pretty(record).context("Failed to serialize package record")?;
    fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}
