//! Progress snapshots published while an operation runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::OperationKind;

/// Lifecycle stage of an operation.
///
/// Stages only move forward. Cancellation and planning failures jump straight
/// to [`Stage::Complete`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
pub enum Stage {
    #[default]
    Undefined,
    Preflighting,
    Running,
    Complete,
}

impl Stage {
    /// Check if moving from this stage to `next` is a forward transition.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        next > *self
    }
}

/// How a finished operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum Outcome {
    /// Every task completed.
    Succeeded,
    /// Finished, but some items were skipped.
    #[strum(to_string = "Partially succeeded")]
    PartialWithSkips,
    /// Stopped by a conflict or error decision; completed tasks remain.
    Aborted,
    /// Stopped by the caller.
    Cancelled,
}

impl Outcome {
    /// Whether the operation ran to the end of its task list.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartialWithSkips)
    }
}

/// A consistent snapshot of an operation's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// The type of operation.
    pub operation: OperationKind,
    /// Current lifecycle stage.
    pub stage: Stage,
    /// Source root currently being processed.
    pub source_path: Option<PathBuf>,
    /// Destination root currently being processed.
    pub destination_path: Option<PathBuf>,
    /// Item currently being processed.
    pub source_item: Option<PathBuf>,
    /// Destination of the item currently being processed.
    pub destination_item: Option<PathBuf>,
    /// Total bytes to process, fixed once preflighting ends.
    pub total_bytes: u64,
    /// Bytes processed so far.
    pub completed_bytes: u64,
    /// Total items (files and symlinks) to process.
    pub total_objects: u64,
    /// Items processed so far.
    pub completed_objects: u64,
    /// Recent transfer rate in bytes per second.
    pub throughput: f64,
    /// Set once the stage is [`Stage::Complete`].
    pub outcome: Option<Outcome>,
}

impl OperationStatus {
    /// Create an empty status for an operation that has not started.
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            stage: Stage::Undefined,
            source_path: None,
            destination_path: None,
            source_item: None,
            destination_item: None,
            total_bytes: 0,
            completed_bytes: 0,
            total_objects: 0,
            completed_objects: 0,
            throughput: 0.0,
            outcome: None,
        }
    }

    /// Get the progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes > 0 {
            (self.completed_bytes as f64 / self.total_bytes as f64) * 100.0
        } else if self.total_objects > 0 {
            (self.completed_objects as f64 / self.total_objects as f64) * 100.0
        } else if self.is_complete() {
            100.0
        } else {
            0.0
        }
    }

    pub fn is_complete(&self) -> bool {
        self.stage == Stage::Complete
    }

    /// Bytes left to process.
    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.completed_bytes)
    }
}
