//! Inputs and answers for conflict and error decisions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{OperationKind, TransferError};

/// Kind of filesystem item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ItemKind {
    File,
    Directory,
    Symlink,
}

impl ItemKind {
    /// Classify a file type without following symlinks.
    pub fn from_file_type(file_type: &std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Directory
        } else {
            Self::File
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// How to resolve a destination collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display)]
pub enum ConflictResolution {
    /// Abort the entire operation.
    #[default]
    Quit,
    /// Leave this item alone and continue.
    Skip,
    /// Replace the existing item.
    Replace,
    /// Keep the existing item and write the new one under the proposed name.
    #[strum(to_string = "Keep both")]
    KeepBoth,
    /// Merge directory contents instead of replacing the directory.
    Merge,
}

/// A destination collision awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictContext {
    /// The operation being performed.
    pub operation: OperationKind,
    /// The item being transferred.
    pub source: PathBuf,
    /// The occupied destination.
    pub destination: PathBuf,
    /// Kind of the item being transferred.
    pub source_kind: ItemKind,
    /// Kind of the item already at the destination.
    pub destination_kind: ItemKind,
    /// Alternate destination used for [`ConflictResolution::KeepBoth`].
    ///
    /// Pre-filled with a free sibling name; a resolver may overwrite it.
    pub proposed: PathBuf,
}

impl ConflictContext {
    /// Replace the proposed alternate destination.
    pub fn propose(&mut self, path: impl Into<PathBuf>) {
        self.proposed = path.into();
    }
}

/// Why an item could not be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Display)]
pub enum ErrorReason {
    #[default]
    Other,
    #[strum(to_string = "Item not readable")]
    NotReadable,
    #[strum(to_string = "Item not writable")]
    NotWritable,
    #[strum(to_string = "Item not movable")]
    NotMovable,
    #[strum(to_string = "Item not deletable")]
    NotDeletable,
    #[strum(to_string = "Item locked")]
    Locked,
    #[strum(to_string = "No free space")]
    NoFreeSpace,
}

impl ErrorReason {
    /// Permission-class reasons are eligible for automatic skipping.
    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            Self::NotReadable
                | Self::NotWritable
                | Self::NotMovable
                | Self::NotDeletable
                | Self::Locked
        )
    }
}

/// When an error was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ErrorPhase {
    /// While walking sources to build the task list.
    Preflighting,
    /// While transferring an item.
    Running,
}

/// A recoverable error awaiting a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// The operation being performed.
    pub operation: OperationKind,
    /// When the error was raised.
    pub phase: ErrorPhase,
    /// The failing item.
    pub source: PathBuf,
    /// The destination of the failing item, if any.
    pub destination: Option<PathBuf>,
    /// Classified cause.
    pub reason: ErrorReason,
    /// Bytes needed when the reason is [`ErrorReason::NoFreeSpace`].
    pub needed_space: Option<u64>,
    /// Human-readable detail.
    pub message: String,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
}

impl ErrorContext {
    /// Build a context for a failed transfer.
    pub fn from_transfer(
        operation: OperationKind,
        phase: ErrorPhase,
        source: PathBuf,
        destination: Option<PathBuf>,
        error: &TransferError,
        attempt: u32,
    ) -> Self {
        Self {
            operation,
            phase,
            source,
            destination,
            reason: error.reason,
            needed_space: error.needed_space,
            message: error.message.clone(),
            attempt,
        }
    }
}

/// What to do after an item error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ErrorDecision {
    /// Attempt the same item again.
    Retry,
    /// Leave the item and continue with the next one.
    Skip,
    /// Stop the operation.
    Abort,
}

impl From<bool> for ErrorDecision {
    /// `true` means "proceed", which skips the failed item.
    fn from(proceed: bool) -> Self {
        if proceed { Self::Skip } else { Self::Abort }
    }
}
