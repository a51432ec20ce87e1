//! Bundle definitions and their binary content references.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_MIME_TYPE: &str = "application/java-archive";

/// Location and MIME type of a bundle archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryFile {
    pub url: Url,
    pub mime_type: String,
}

impl BinaryFile {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
        }
    }

    pub fn with_mime_type(url: Url, mime_type: impl Into<String>) -> Self {
        Self {
            url,
            mime_type: mime_type.into(),
        }
    }

    /// Reference a file on the local filesystem. The path must be absolute.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let url = Url::from_file_path(path)
            .map_err(|_| anyhow::anyhow!("Not an absolute file path: {}", path.display()))?;
        Ok(Self::new(url))
    }

    /// Local path for `file:` URLs, `None` for any other scheme.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        if self.url.scheme() != "file" {
            return None;
        }
        self.url.to_file_path().ok()
    }
}

/// A named, versioned package.
///
/// The composite name (`symbolicName-version`) is always derived; there is
/// no setter for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    symbolic_name: String,
    version: String,
    display_name: Option<String>,
    file_name: Option<String>,
    file: Option<BinaryFile>,
    checksum: Option<String>,
}

impl Bundle {
    pub fn new(symbolic_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version: version.into(),
            display_name: None,
            file_name: None,
            file: None,
            checksum: None,
        }
    }

    /// Composite name `symbolicName-version`.
    pub fn name(&self) -> String {
        composite_name(&self.symbolic_name, &self.version)
    }

    pub fn symbolic_name(&self) -> &str {
        &self.symbolic_name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn file(&self) -> Option<&BinaryFile> {
        self.file.as_ref()
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn with_display_name(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name;
        self
    }

    pub fn with_file_name(mut self, file_name: Option<String>) -> Self {
        self.file_name = file_name;
        self
    }

    pub fn with_file(mut self, file: BinaryFile) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Same name and same content. A bundle without checksum never matches.
    pub fn same_content(&self, other: &Bundle) -> bool {
        self.name() == other.name()
            && self.checksum.is_some()
            && self.checksum == other.checksum
    }
}

pub fn composite_name(symbolic_name: &str, version: &str) -> String {
    format!("{}-{}", symbolic_name, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_derived_from_symbolic_name_and_version() {
        let bundle = Bundle::new("demo", "1.0");
        assert_eq!(bundle.name(), "demo-1.0");
    }

    #[test]
    fn test_binary_file_defaults_to_archive_mime_type() {
        let file = BinaryFile::new(Url::parse("file:///tmp/demo.jar").expect("valid url"));
        assert_eq!(file.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(file.to_file_path(), Some(PathBuf::from("/tmp/demo.jar")));
    }

    #[test]
    fn test_non_file_urls_have_no_local_path() {
        let file = BinaryFile::new(Url::parse("https://repo/demo.jar").expect("valid url"));
        assert!(file.to_file_path().is_none());
    }

    #[test]
    fn test_content_identity_requires_checksum() {
        let a = Bundle::new("demo", "1.0");
        let b = Bundle::new("demo", "1.0");
        assert!(!a.same_content(&b));

        let a = a.with_checksum("abc");
        let b = b.with_checksum("abc");
        assert!(a.same_content(&b));
        assert!(!a.same_content(&b.clone().with_checksum("def")));
    }
}
