//! Error taxonomy for module management requests and operation outcomes.

use crate::store::StoreError;

/// Stable classification of a [`ModuleError`].
///
/// The `as_str` form is what gets written into a failed operation's reason,
/// so it must not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    ManagementFailure,
    TransientIo,
    BundleNotFound,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::ManagementFailure => "ManagementFailure",
            ErrorKind::TransientIo => "TransientIOFailure",
            ErrorKind::BundleNotFound => "BundleNotFound",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A mandatory field was missing or blank. Not retried.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The package runtime or the catalog refused the action.
    #[error("Management failure: {0}")]
    ManagementFailure(String),

    /// Store or file I/O hiccup, eligible for retry.
    #[error("Transient I/O failure: {0}")]
    TransientIo(#[source] StoreError),

    /// The target bundle is not loaded on this node.
    #[error("Bundle not found: {0}")]
    BundleNotFound(String),
}

impl ModuleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModuleError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ModuleError::ManagementFailure(_) => ErrorKind::ManagementFailure,
            ModuleError::TransientIo(_) => ErrorKind::TransientIo,
            ModuleError::BundleNotFound(_) => ErrorKind::BundleNotFound,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ModuleError::TransientIo(_))
    }

    /// HTTP status an administrative façade should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ModuleError::InvalidRequest(_) => 400,
            ModuleError::ManagementFailure(_) => 417,
            ModuleError::BundleNotFound(_) => 404,
            ModuleError::TransientIo(_) => 503,
        }
    }

    /// Reason string recorded on a failed operation, prefixed with the kind.
    pub fn reason(&self) -> String {
        match self {
            ModuleError::InvalidRequest(msg)
            | ModuleError::ManagementFailure(msg)
            | ModuleError::BundleNotFound(msg) => format!("{}: {}", self.kind(), msg),
            ModuleError::TransientIo(err) => format!("{}: {}", self.kind(), err),
        }
    }
}

impl From<StoreError> for ModuleError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            ModuleError::TransientIo(err)
        } else {
            ModuleError::ManagementFailure(err.to_string())
        }
    }
}
