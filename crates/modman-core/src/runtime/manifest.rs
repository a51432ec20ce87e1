//! Archive manifest (`META-INF/MANIFEST.MF`) reading.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use anyhow::Context;

pub const MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";

pub const SYMBOLIC_NAME: &str = "Bundle-SymbolicName";
pub const DISPLAY_NAME: &str = "Bundle-Name";
pub const BUNDLE_VERSION: &str = "Bundle-Version";
pub const IMPLEMENTATION_VERSION: &str = "Implementation-Version";

/// Main-section headers of an archive manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    headers: BTreeMap<String, String>,
}

impl Manifest {
    pub fn from_headers(headers: BTreeMap<String, String>) -> Self {
        Self { headers }
    }

    /// Parse manifest text. Continuation lines start with a single space;
    /// parsing stops at the first blank line (end of the main section).
    pub fn parse(text: &str) -> Self {
        let mut headers = BTreeMap::new();
        let mut current: Option<(String, String)> = None;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix(' ') {
                if let Some((_, value)) = current.as_mut() {
                    value.push_str(rest);
                }
                continue;
            }
            if let Some((key, value)) = current.take() {
                headers.insert(key, value);
            }
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                current = Some((key.trim().to_string(), value.trim_start().to_string()));
            }
        }
        if let Some((key, value)) = current {
            headers.insert(key, value);
        }
        Self { headers }
    }

    /// Read the manifest out of a zip archive.
    pub fn from_archive(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open archive: {}", path.display()))?;
        let mut archive = zip::ZipArchive::new(file)
            .with_context(|| format!("Failed to read archive: {}", path.display()))?;
        let mut entry = archive
            .by_name(MANIFEST_ENTRY)
            .with_context(|| format!("Archive has no {}: {}", MANIFEST_ENTRY, path.display()))?;
        let mut text = String::new();
        entry
            .read_to_string(&mut text)
            .with_context(|| format!("Failed to read manifest of {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Symbolic name without directives (`demo;singleton:=true` → `demo`).
    pub fn symbolic_name(&self) -> Option<&str> {
        self.get(SYMBOLIC_NAME)
            .map(|value| value.split(';').next().unwrap_or(value).trim())
            .filter(|value| !value.is_empty())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.get(DISPLAY_NAME)
    }

    /// Implementation version, falling back to the bundle version.
    pub fn version(&self) -> Option<&str> {
        self.get(IMPLEMENTATION_VERSION)
            .or_else(|| self.get(BUNDLE_VERSION))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Composite `symbolicName-version`, when both are present.
    pub fn composite_name(&self) -> Option<String> {
        Some(crate::model::bundle::composite_name(
            self.symbolic_name()?,
            self.version()?,
        ))
    }

    /// Whether any of the marker headers is present.
    pub fn has_any(&self, markers: &[String]) -> bool {
        markers.iter().any(|marker| self.headers.contains_key(marker))
    }
}
