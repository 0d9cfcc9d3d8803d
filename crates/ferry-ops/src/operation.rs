//! The public entry point for copy, move and delete.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ferry_core::{
    Destinations, OperationConfig, OperationError, OperationOptions, OperationRequest,
    PlanningError,
};
use tokio_util::sync::CancellationToken;

use crate::delegate::{Dispatcher, OperationDelegate};
use crate::executor::OperationExecutor;
use crate::handle::OperationHandle;
use crate::planner::{OperationPlanner, Plan};
use crate::report::OperationReport;
use crate::transfer::{FsTransfer, ItemTransfer};

/// Runs file operations.
///
/// One `FileOperation` may start any number of operations; each gets its own
/// handle, cancellation token and executor. Async entry points must be called
/// from within a Tokio runtime. The `_sync` variants block the calling thread
/// and must not be called from within one.
pub struct FileOperation {
    delegate: Option<Arc<dyn OperationDelegate>>,
    transfer: Option<Arc<dyn ItemTransfer>>,
    config: OperationConfig,
    next_id: AtomicU64,
}

impl Default for FileOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl FileOperation {
    /// Create a façade with default settings and no delegate.
    pub fn new() -> Self {
        Self::with_config(OperationConfig::default())
    }

    pub fn with_config(config: OperationConfig) -> Self {
        Self {
            delegate: None,
            transfer: None,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    /// Set the delegate consulted for conflicts, errors and progress.
    pub fn with_delegate(self, delegate: impl OperationDelegate + 'static) -> Self {
        self.with_shared_delegate(Arc::new(delegate))
    }

    pub fn with_shared_delegate(mut self, delegate: Arc<dyn OperationDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Replace the filesystem transfer primitive.
    pub fn with_transfer(mut self, transfer: impl ItemTransfer + 'static) -> Self {
        self.transfer = Some(Arc::new(transfer));
        self
    }

    /// Set the minimum time between published snapshots for operations
    /// started after this call.
    pub fn set_status_change_interval(&mut self, interval: Duration) {
        self.config.status_change_interval = interval;
    }

    pub fn config(&self) -> &OperationConfig {
        &self.config
    }

    /// Build the plan for `request` without executing it.
    ///
    /// Unreadable entries are offered to the delegate as during a real run.
    pub fn plan(&self, request: &OperationRequest) -> Result<Plan, PlanningError> {
        let planner = OperationPlanner::new(
            self.transfer(),
            Dispatcher::new(self.delegate.clone()),
            CancellationToken::new(),
        );
        planner.plan(request)
    }

    /// Start an operation in the background.
    pub fn start(&self, request: OperationRequest) -> OperationHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let operation = request.kind();
        let cancel = CancellationToken::new();

        let (executor, status) = OperationExecutor::new(
            operation,
            self.transfer(),
            Dispatcher::new(self.delegate.clone()),
            self.config.clone(),
            cancel.clone(),
        );
        let task = tokio::spawn(executor.execute(request));
        OperationHandle::new(id, operation, cancel, status, task)
    }

    /// Run an operation to completion on the calling thread.
    ///
    /// Completing with skipped items is `Ok`; any fatal cause, including
    /// cancellation, is returned as the error.
    pub fn run_sync(&self, request: OperationRequest) -> Result<OperationReport, OperationError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(OperationError::NestedRuntime);
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| OperationError::Runtime {
                message: e.to_string(),
            })?;

        let report = runtime.block_on(async { self.start(request).wait().await });
        report.into_result()
    }

    /// Copy several items.
    pub fn copy(
        &self,
        sources: Vec<PathBuf>,
        destinations: Destinations,
        options: OperationOptions,
    ) -> OperationHandle {
        self.start(OperationRequest::copy(sources, destinations, options))
    }

    /// Copy one item to a full destination path.
    pub fn copy_item(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: OperationOptions,
    ) -> OperationHandle {
        self.copy(vec![source.into()], Destinations::single(destination), options)
    }

    pub fn copy_sync(
        &self,
        sources: Vec<PathBuf>,
        destinations: Destinations,
        options: OperationOptions,
    ) -> Result<OperationReport, OperationError> {
        self.run_sync(OperationRequest::copy(sources, destinations, options))
    }

    pub fn copy_item_sync(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: OperationOptions,
    ) -> Result<OperationReport, OperationError> {
        self.copy_sync(vec![source.into()], Destinations::single(destination), options)
    }

    /// Move several items.
    pub fn move_items(
        &self,
        sources: Vec<PathBuf>,
        destinations: Destinations,
        options: OperationOptions,
    ) -> OperationHandle {
        self.start(OperationRequest::move_to(sources, destinations, options))
    }

    /// Move one item to a full destination path.
    pub fn move_item(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: OperationOptions,
    ) -> OperationHandle {
        self.move_items(vec![source.into()], Destinations::single(destination), options)
    }

    pub fn move_sync(
        &self,
        sources: Vec<PathBuf>,
        destinations: Destinations,
        options: OperationOptions,
    ) -> Result<OperationReport, OperationError> {
        self.run_sync(OperationRequest::move_to(sources, destinations, options))
    }

    pub fn move_item_sync(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        options: OperationOptions,
    ) -> Result<OperationReport, OperationError> {
        self.move_sync(vec![source.into()], Destinations::single(destination), options)
    }

    /// Delete several items.
    pub fn delete(&self, targets: Vec<PathBuf>, options: OperationOptions) -> OperationHandle {
        self.start(OperationRequest::delete(targets, options))
    }

    pub fn delete_item(&self, target: impl Into<PathBuf>, options: OperationOptions) -> OperationHandle {
        self.delete(vec![target.into()], options)
    }

    pub fn delete_sync(
        &self,
        targets: Vec<PathBuf>,
        options: OperationOptions,
    ) -> Result<OperationReport, OperationError> {
        self.run_sync(OperationRequest::delete(targets, options))
    }

    pub fn delete_item_sync(
        &self,
        target: impl Into<PathBuf>,
        options: OperationOptions,
    ) -> Result<OperationReport, OperationError> {
        self.delete_sync(vec![target.into()], options)
    }

    fn transfer(&self) -> Arc<dyn ItemTransfer> {
        match &self.transfer {
            Some(transfer) => Arc::clone(transfer),
            None => Arc::new(FsTransfer::new(self.config.sync_writes)),
        }
    }
}
