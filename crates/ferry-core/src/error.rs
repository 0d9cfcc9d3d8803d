//! Error types for file operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ErrorReason, OperationKind};

/// Fatal errors raised while turning a request into tasks.
///
/// No task has been attempted when one of these is returned.
#[derive(Debug, Error)]
pub enum PlanningError {
    /// Source path not found.
    #[error("Source not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// Source path has no final component to place into a directory.
    #[error("Source has no file name: {path}")]
    InvalidSource { path: PathBuf },

    /// Destination parent is missing or is not a directory.
    #[error("Destination parent not found or not a directory: {path}")]
    DestinationParentMissing { path: PathBuf },

    /// Destination parent cannot be written to.
    #[error("Destination parent is not writable: {path}")]
    DestinationNotWritable { path: PathBuf },

    /// Destination lies inside the directory being transferred.
    #[error("Cannot transfer {item} into itself ({destination})")]
    DestinationInsideSource { item: PathBuf, destination: PathBuf },

    /// Destination is a directory that contains the item being transferred.
    #[error("Cannot replace {destination} with {item}, which it contains")]
    SourceInsideDestination { item: PathBuf, destination: PathBuf },

    /// Source and destination are the same item.
    #[error("Source and destination are the same item: {path}")]
    SameItem { path: PathBuf },

    /// Destination list does not line up with the source list.
    #[error("{sources} sources but {destinations} destinations")]
    DestinationCountMismatch { sources: usize, destinations: usize },

    /// A copy or move was submitted without destinations.
    #[error("{kind} requires a destination")]
    MissingDestination { kind: OperationKind },

    /// An entry could not be read and the error policy refused to continue.
    #[error("Cannot read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    /// Generic I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Planning was cancelled before it finished.
    #[error("Planning cancelled")]
    Cancelled,
}

impl PlanningError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::SourceNotFound { path },
            _ => Self::Io { path, source },
        }
    }
}

/// A per-item failure reported by the transfer primitive.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}: {path}: {message}")]
pub struct TransferError {
    /// Classified cause.
    pub reason: ErrorReason,
    /// The path that caused the error.
    pub path: PathBuf,
    /// Bytes needed when the reason is [`ErrorReason::NoFreeSpace`].
    pub needed_space: Option<u64>,
    /// A human-readable error message.
    pub message: String,
}

impl TransferError {
    /// Create a new transfer error.
    pub fn new(reason: ErrorReason, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            reason,
            path: path.into(),
            needed_space: None,
            message: message.into(),
        }
    }

    /// Create an out-of-space error.
    pub fn no_free_space(path: impl Into<PathBuf>, needed: u64, message: impl Into<String>) -> Self {
        Self {
            needed_space: Some(needed),
            ..Self::new(ErrorReason::NoFreeSpace, path, message)
        }
    }

    /// Classify an I/O error.
    ///
    /// Permission failures map to `denied`, which the caller picks according
    /// to what it was doing (reading, writing, moving or deleting).
    pub fn from_io(path: impl Into<PathBuf>, error: &std::io::Error, denied: ErrorReason) -> Self {
        use std::io::ErrorKind;

        let reason = match error.kind() {
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => denied,
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => ErrorReason::NoFreeSpace,
            _ => ErrorReason::Other,
        };
        Self::new(reason, path, error.to_string())
    }

    /// Attach the number of bytes the failed write needed.
    pub fn with_needed_space(mut self, needed: u64) -> Self {
        if self.reason == ErrorReason::NoFreeSpace {
            self.needed_space = Some(needed);
        }
        self
    }
}

/// The first fatal cause of an unsuccessful operation.
#[derive(Debug, Error)]
pub enum OperationError {
    /// The request could not be planned.
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// A conflict was answered with Quit (or nobody answered it).
    #[error("conflict unresolved: {destination} already exists")]
    ConflictUnresolved { item: PathBuf, destination: PathBuf },

    /// An item failed and the error policy aborted.
    #[error("{operation} failed for {item}: {error}")]
    ItemFailed {
        operation: OperationKind,
        item: PathBuf,
        #[source]
        error: TransferError,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A synchronous entry point was called from inside an async runtime.
    #[error("Synchronous file operations cannot block inside an async runtime")]
    NestedRuntime,

    /// The engine's runtime failed.
    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

impl OperationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Planning(PlanningError::Cancelled)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_error_io() {
        let err = PlanningError::io(
            "/test/path",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(matches!(err, PlanningError::SourceNotFound { .. }));
    }

    #[test]
    fn test_transfer_error_from_io() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = TransferError::from_io("/a", &denied, ErrorReason::NotDeletable);
        assert_eq!(err.reason, ErrorReason::NotDeletable);

        let full = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        let err = TransferError::from_io("/a", &full, ErrorReason::NotWritable).with_needed_space(42);
        assert_eq!(err.reason, ErrorReason::NoFreeSpace);
        assert_eq!(err.needed_space, Some(42));

        let other = std::io::Error::other("boom");
        let err = TransferError::from_io("/a", &other, ErrorReason::NotWritable).with_needed_space(42);
        assert_eq!(err.reason, ErrorReason::Other);
        assert_eq!(err.needed_space, None);
    }

    #[test]
    fn test_conflict_unresolved_message() {
        let err = OperationError::ConflictUnresolved {
            item: PathBuf::from("/src/a"),
            destination: PathBuf::from("/dst/a"),
        };
        assert!(err.to_string().starts_with("conflict unresolved"));
    }

    #[test]
    fn test_cancelled() {
        assert!(OperationError::Cancelled.is_cancelled());
        assert!(OperationError::from(PlanningError::Cancelled).is_cancelled());
        assert!(!OperationError::NestedRuntime.is_cancelled());
    }
}
