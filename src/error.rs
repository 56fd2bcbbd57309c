//! Error types for storage operations.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors that can occur while allocating, migrating or releasing
/// entry storage.
#[derive(Debug)]
pub enum StorageError {
    /// Heap or device allocation exhausted. Never absorbed; always
    /// surfaced to the caller.
    AllocationFailed,

    /// No free tile is available in the pooled tile file.
    /// Allocation paths absorb this by falling back to RAM; the owning
    /// cache may instead provision another slot file.
    TileExhausted,

    /// A restore-from-disk path was given a file that does not exist.
    /// Hard failure: the caller explicitly expected previously-computed
    /// data, so there is no safe fallback.
    MissingArtifact(PathBuf),

    /// The cache root is empty or not an existing directory.
    /// Raised before any I/O is attempted.
    InvalidCacheRoot,

    /// Operation not supported by this entry or collaborator kind.
    Unsupported,

    /// An underlying I/O operation failed (mapping, resize, flush,
    /// file removal).
    Io(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed => write!(f, "storage allocation failed"),
            Self::TileExhausted => write!(f, "no free tile in slot file"),
            Self::MissingArtifact(path) => {
                write!(f, "missing cached artifact: {}", path.display())
            }
            Self::InvalidCacheRoot => write!(f, "cache root is empty or not a directory"),
            Self::Unsupported => write!(f, "operation not supported"),
            Self::Io(err) => write!(f, "storage I/O error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
