//! Error types for the harness protocol.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by harness components.
///
/// Policy outcomes (scope violations, gate breaches, failed checks) are not
/// errors; they are returned as ordinary reports.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("schema violation: {}", .0.join("; "))]
    Schema(Vec<String>),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("ledger corruption at {path}: expected {expected}, got {actual}")]
    LedgerCorruption {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HarnessError {
    /// Corruption and exclusive-create collisions halt the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerCorruption { .. } | Self::AlreadyExists(_))
    }

    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema(vec![reason.into()])
    }

    pub fn io_at(path: &std::path::Path, error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::AlreadyExists {
            return Self::AlreadyExists(path.to_path_buf());
        }
        Self::Io(format!("{}: {error}", path.display()))
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
