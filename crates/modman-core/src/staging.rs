//! Durable, content-addressed placement of uploaded bundle archives.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::fs::copy_with_checksum;
use crate::model::BinaryFile;

/// Where staged content ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedContent {
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
}

impl StagedContent {
    pub fn binary_file(&self) -> anyhow::Result<BinaryFile> {
        BinaryFile::from_path(&self.path)
    }
}

/// Puts uploaded bytes somewhere every node can read them from.
pub trait ContentStager: Send + Sync + std::fmt::Debug {
    fn stage(&self, filename: &str, content: &mut dyn Read) -> anyhow::Result<StagedContent>;
}

/// Stages content under `<root>/<checksum>/<filename>`.
///
/// Identical uploads land in the same place, so staging twice is harmless.
#[derive(Debug, Clone)]
pub struct DirectoryStager {
    root: PathBuf,
}

impl DirectoryStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ContentStager for DirectoryStager {
    fn stage(&self, filename: &str, content: &mut dyn Read) -> anyhow::Result<StagedContent> {
        let file_name = sanitize_file_name(filename)?;
        let incoming = self.root.join(".incoming");
        fs::create_dir_all(&incoming).with_context(|| {
            format!("Failed to create staging directory: {}", incoming.display())
        })?;

        let tmp_path = incoming.join(format!(
            "{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        let (checksum, size) = {
            let mut tmp = fs::File::create(&tmp_path)
                .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
            copy_with_checksum(content, &mut tmp)
                .with_context(|| format!("Failed to stage {}", filename))?
        };

        let target_dir = self.root.join(&checksum);
        let target = target_dir.join(&file_name);
        if target.is_file() {
            debug!(path = %target.display(), "Content already staged");
            fs::remove_file(&tmp_path)
                .with_context(|| format!("Failed to remove {}", tmp_path.display()))?;
        } else {
            fs::create_dir_all(&target_dir)
                .with_context(|| format!("Failed to create {}", target_dir.display()))?;
            fs::rename(&tmp_path, &target).with_context(|| {
                format!("Failed to move staged content to {}", target.display())
            })?;
            debug!(path = %target.display(), size, "Content staged");
        }

        let path = fs::canonicalize(&target)
            .with_context(|| format!("Failed to resolve {}", target.display()))?;
        Ok(StagedContent {
            path,
            checksum,
            size,
        })
    }
}

/// Keep only the final path component of an uploaded file name.
fn sanitize_file_name(filename: &str) -> anyhow::Result<String> {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." || name.starts_with('.') {
        anyhow::bail!("Invalid upload file name '{}'", filename);
    }
    Ok(name.to_string())
}
