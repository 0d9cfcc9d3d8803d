//! Handles to running operations.

use ferry_core::{OperationError, OperationKind, OperationStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::report::OperationReport;

/// A live, cancellable operation.
///
/// Dropping the handle does not stop the operation.
#[derive(Debug)]
pub struct OperationHandle {
    id: u64,
    operation: OperationKind,
    cancel: CancellationToken,
    status: watch::Receiver<OperationStatus>,
    task: JoinHandle<OperationReport>,
}

impl OperationHandle {
    pub(crate) fn new(
        id: u64,
        operation: OperationKind,
        cancel: CancellationToken,
        status: watch::Receiver<OperationStatus>,
        task: JoinHandle<OperationReport>,
    ) -> Self {
        Self {
            id,
            operation,
            cancel,
            status,
            task,
        }
    }

    /// Identifier unique within the [`FileOperation`](crate::FileOperation)
    /// that started this operation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    /// The most recently published snapshot.
    pub fn status(&self) -> OperationStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<OperationStatus> {
        self.status.clone()
    }

    /// Request cancellation. Transfers already in flight finish first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the operation to complete and return its report.
    pub async fn wait(self) -> OperationReport {
        match self.task.await {
            Ok(report) => report,
            Err(error) => {
                let status = self.status.borrow().clone();
                OperationReport::from_failure(
                    status,
                    OperationError::Runtime {
                        message: error.to_string(),
                    },
                )
            }
        }
    }
}
