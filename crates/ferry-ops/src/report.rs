//! Final results of a finished operation.

use std::path::PathBuf;

use ferry_core::{OperationError, OperationKind, OperationStatus, Outcome, TransferError};
use serde::{Deserialize, Serialize, Serializer};

/// Why an item was left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// The conflict resolver chose to skip.
    Conflict,
    /// Merge was requested for something other than two directories.
    InvalidMerge,
    /// The error policy chose to skip after a failure.
    Error(TransferError),
    /// A permission-class failure skipped without asking.
    PermissionAutoSkip(TransferError),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conflict => write!(f, "destination already exists"),
            Self::InvalidMerge => write!(f, "only directories can be merged"),
            Self::Error(error) | Self::PermissionAutoSkip(error) => {
                write!(f, "{}: {}", error.reason, error.message)
            }
        }
    }
}

/// An item that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub path: PathBuf,
    pub reason: SkipReason,
}

/// Result of a completed operation.
#[derive(Debug, Serialize)]
pub struct OperationReport {
    /// The type of operation.
    pub operation: OperationKind,
    /// How the operation ended.
    pub outcome: Outcome,
    /// The final published snapshot.
    pub status: OperationStatus,
    /// Number of tasks that completed.
    pub succeeded: usize,
    /// Number of items skipped by a conflict or error decision.
    pub skipped: usize,
    /// File bytes actually written.
    pub bytes_transferred: u64,
    pub skipped_items: Vec<SkippedItem>,
    /// The first fatal cause, if the operation did not run to the end.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<OperationError>,
}

impl OperationReport {
    /// Report for an operation whose task died before producing a report.
    pub(crate) fn from_failure(status: OperationStatus, error: OperationError) -> Self {
        Self {
            operation: status.operation,
            outcome: Outcome::Aborted,
            status,
            succeeded: 0,
            skipped: 0,
            bytes_transferred: 0,
            skipped_items: Vec::new(),
            error: Some(error),
        }
    }

    /// Check if the operation ran to the end of its task list.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Get a human-readable summary of the operation.
    pub fn summary(&self) -> String {
        let action = self.operation.past_tense();
        let mut summary = if self.skipped == 0 {
            format!("{} {} items", action, self.succeeded)
        } else {
            format!("{} {} items, {} skipped", action, self.succeeded, self.skipped)
        };

        match (&self.outcome, &self.error) {
            (Outcome::Succeeded | Outcome::PartialWithSkips, _) => {}
            (Outcome::Cancelled, _) => summary.push_str(" (cancelled)"),
            (Outcome::Aborted, Some(error)) => summary.push_str(&format!(" (aborted: {error})")),
            (Outcome::Aborted, None) => summary.push_str(" (aborted)"),
        }
        summary
    }

    /// Split into the report or its fatal error.
    pub fn into_result(mut self) -> Result<Self, OperationError> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

fn serialize_error<S: Serializer>(
    error: &Option<OperationError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(error) => serializer.serialize_some(&error.to_string()),
        None => serializer.serialize_none(),
    }
}
