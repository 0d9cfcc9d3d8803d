//! Drives a plan: conflicts, errors, progress and cancellation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferry_core::{
    ConflictContext, ConflictResolution, ErrorContext, ErrorDecision, ErrorPhase, ErrorReason,
    ItemKind, OperationConfig, OperationError, OperationKind, OperationOptions, OperationRequest,
    OperationStatus, Outcome, PlanningError, Stage, TransferError,
};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conflict::auto_rename_path;
use crate::delegate::Dispatcher;
use crate::planner::{OperationPlanner, Plan, RootPlan, Task, TaskId, resolve};
use crate::progress::StatusPublisher;
use crate::report::{OperationReport, SkipReason, SkippedItem};
use crate::transfer::ItemTransfer;

/// How a single task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Skipped,
    /// Source left in place because a dependency or descendant was kept.
    Retained,
    /// Inside a skipped directory.
    Pruned,
    /// The operation must stop.
    Failed,
    /// Cancellation was observed before the item was touched.
    Interrupted,
}

impl TaskOutcome {
    fn advances(&self) -> bool {
        !matches!(self, Self::Failed | Self::Interrupted)
    }
}

enum ConflictStep {
    Proceed { destination: PathBuf, clear: bool },
    Done(TaskOutcome),
}

/// Per-root bookkeeping.
#[derive(Debug, Default)]
struct RootState {
    /// Source directories whose subtrees are skipped.
    pruned: Vec<PathBuf>,
    /// Source items left in place.
    retained: Vec<PathBuf>,
    /// Destination prefixes rewritten by "keep both" on a directory.
    redirects: Vec<(PathBuf, PathBuf)>,
    succeeded: HashSet<TaskId>,
}

impl RootState {
    fn is_pruned(&self, source: &Path) -> bool {
        self.pruned.iter().any(|dir| source.starts_with(dir))
    }

    /// Whether `dir` or anything below it was retained.
    fn has_retained(&self, dir: &Path) -> bool {
        self.retained.iter().any(|path| path.starts_with(dir))
    }

    fn redirect(&self, destination: &Path) -> PathBuf {
        self.redirects
            .iter()
            .filter(|(from, _)| destination.starts_with(from))
            .max_by_key(|(from, _)| from.components().count())
            .and_then(|(from, to)| {
                destination
                    .strip_prefix(from)
                    .ok()
                    .map(|rest| if rest.as_os_str().is_empty() { to.clone() } else { to.join(rest) })
            })
            .unwrap_or_else(|| destination.to_path_buf())
    }
}

#[derive(Debug, Default)]
struct RunState {
    succeeded: usize,
    skipped: usize,
    bytes_transferred: u64,
    skipped_items: Vec<SkippedItem>,
    first_error: Option<OperationError>,
}

/// Executes one request from preflight to completion.
pub(crate) struct OperationExecutor {
    operation: OperationKind,
    transfer: Arc<dyn ItemTransfer>,
    dispatcher: Dispatcher,
    publisher: StatusPublisher,
    config: OperationConfig,
    /// Cancelled by the caller or the progress callback.
    cancel: CancellationToken,
    /// Child of `cancel`, also cancelled when the operation aborts.
    abort: CancellationToken,
    state: Mutex<RunState>,
    processed: AtomicUsize,
    total_tasks: AtomicUsize,
}

impl OperationExecutor {
    pub(crate) fn new(
        operation: OperationKind,
        transfer: Arc<dyn ItemTransfer>,
        dispatcher: Dispatcher,
        config: OperationConfig,
        cancel: CancellationToken,
    ) -> (Arc<Self>, watch::Receiver<OperationStatus>) {
        let (publisher, status) = StatusPublisher::new(operation, config.status_change_interval);
        let abort = cancel.child_token();
        let executor = Arc::new(Self {
            operation,
            transfer,
            dispatcher,
            publisher,
            config,
            cancel,
            abort,
            state: Mutex::new(RunState::default()),
            processed: AtomicUsize::new(0),
            total_tasks: AtomicUsize::new(0),
        });
        (executor, status)
    }

    pub(crate) async fn execute(self: Arc<Self>, request: OperationRequest) -> OperationReport {
        info!(
            operation = %self.operation,
            sources = request.sources().len(),
            options = request.options().bits(),
            "Starting operation"
        );

        self.notify(self.publisher.transition(Stage::Preflighting)).await;

        let planner = OperationPlanner::new(
            Arc::clone(&self.transfer),
            self.dispatcher.clone(),
            self.abort.clone(),
        );
        let planned = tokio::task::spawn_blocking(move || planner.plan(&request)).await;

        let plan = match planned {
            Ok(Ok(plan)) => plan,
            Ok(Err(PlanningError::Cancelled)) => return self.finish().await,
            Ok(Err(error)) => {
                self.fail(error.into());
                return self.finish().await;
            }
            Err(error) => {
                self.fail(OperationError::Runtime {
                    message: error.to_string(),
                });
                return self.finish().await;
            }
        };

        self.total_tasks.store(plan.task_count(), Ordering::SeqCst);
        self.notify(self.publisher.begin_running(&plan)).await;
        self.run_roots(plan).await;
        self.finish().await
    }

    async fn run_roots(self: &Arc<Self>, plan: Plan) {
        let Plan { roots, options, .. } = plan;

        if self.config.max_concurrent_roots <= 1 {
            for root in roots {
                if self.abort.is_cancelled() {
                    break;
                }
                self.run_root(options, root).await;
            }
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_roots));
        let mut running = JoinSet::new();
        for root in roots {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            if self.abort.is_cancelled() {
                break;
            }
            let this = Arc::clone(self);
            running.spawn(async move {
                let _permit = permit;
                this.run_root(options, root).await;
            });
        }

        while let Some(result) = running.join_next().await {
            if let Err(error) = result {
                self.fail(OperationError::Runtime {
                    message: error.to_string(),
                });
            }
        }
    }

    async fn run_root(&self, options: OperationOptions, root: RootPlan) {
        debug!(source = %root.source.display(), tasks = root.tasks.len(), "Processing root");
        let mut state = RootState::default();

        for task in &root.tasks {
            if self.abort.is_cancelled() {
                break;
            }
            self.publisher.set_current(
                root.source.clone(),
                root.destination.clone(),
                task.source.clone(),
                task.destination.clone(),
            );

            let outcome = self.process(options, task, &mut state).await;
            debug!(id = task.id, action = ?task.action, ?outcome, "Task finished");
            if !outcome.advances() {
                break;
            }

            let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
            let last = processed >= self.total_tasks.load(Ordering::SeqCst);
            self.notify(self.publisher.advance(task.bytes, task.objects(), last))
                .await;
        }
    }

    async fn process(
        &self,
        options: OperationOptions,
        task: &Task,
        root: &mut RootState,
    ) -> TaskOutcome {
        if let Some(dependency) = task.depends_on {
            if !root.succeeded.contains(&dependency) {
                warn!(path = %task.source.display(), "Keeping source, its copy did not complete");
                root.retained.push(task.source.clone());
                return TaskOutcome::Retained;
            }
        }

        if task.action.checks_conflicts() {
            if root.is_pruned(&task.source) {
                return TaskOutcome::Pruned;
            }
        } else if task.item.is_dir() && root.has_retained(&task.source) {
            debug!(path = %task.source.display(), "Keeping directory with retained contents");
            root.retained.push(task.source.clone());
            return TaskOutcome::Retained;
        }

        let mut destination = task.destination.as_deref().map(|d| root.redirect(d));
        let mut clear_first = false;

        if task.action.checks_conflicts() {
            if let Some(target) = destination.take() {
                match self.resolve_conflicts(options, task, target, root).await {
                    ConflictStep::Proceed {
                        destination: resolved,
                        clear,
                    } => {
                        destination = Some(resolved);
                        clear_first = clear;
                    }
                    ConflictStep::Done(outcome) => return outcome,
                }
            }
        }

        if self.abort.is_cancelled() {
            return TaskOutcome::Interrupted;
        }

        self.attempt(options, task, destination, clear_first, root)
            .await
    }

    /// Ask for decisions until the destination is free, replaceable or given up.
    async fn resolve_conflicts(
        &self,
        options: OperationOptions,
        task: &Task,
        mut destination: PathBuf,
        root: &mut RootState,
    ) -> ConflictStep {
        let original = destination.clone();

        loop {
            let target = destination.clone();
            let existing = match self.blocking(move |t| t.probe(&target)).await {
                Ok(existing) => existing,
                Err(error) => {
                    self.fail(error);
                    return ConflictStep::Done(TaskOutcome::Failed);
                }
            };
            let Some(destination_kind) = existing else {
                root.remember_redirect(task.item, &original, &destination);
                return ConflictStep::Proceed {
                    destination,
                    clear: false,
                };
            };

            let (resolution, proposed) = if options.overwrite {
                (ConflictResolution::Replace, None)
            } else {
                match self.ask_conflict(task, &destination, destination_kind).await {
                    Ok(answer) => answer,
                    Err(error) => {
                        self.fail(error);
                        return ConflictStep::Done(TaskOutcome::Failed);
                    }
                }
            };
            if self.cancel.is_cancelled() {
                return ConflictStep::Done(TaskOutcome::Interrupted);
            }

            debug!(
                path = %destination.display(),
                %resolution,
                "Resolved conflict"
            );

            match resolution {
                ConflictResolution::Quit => {
                    self.fail(OperationError::ConflictUnresolved {
                        item: task.source.clone(),
                        destination,
                    });
                    return ConflictStep::Done(TaskOutcome::Failed);
                }
                ConflictResolution::Skip => {
                    return ConflictStep::Done(self.skip(task, root, SkipReason::Conflict));
                }
                ConflictResolution::Replace => {
                    root.remember_redirect(task.item, &original, &destination);
                    let clear = destination_kind.is_dir() || destination_kind != task.item;
                    return ConflictStep::Proceed { destination, clear };
                }
                ConflictResolution::KeepBoth => match proposed {
                    Some(proposed) if proposed != destination => destination = proposed,
                    _ => return ConflictStep::Done(self.skip(task, root, SkipReason::Conflict)),
                },
                ConflictResolution::Merge => {
                    if task.item.is_dir() && destination_kind.is_dir() {
                        root.remember_redirect(task.item, &original, &destination);
                        root.succeeded.insert(task.id);
                        self.record_success(0);
                        return ConflictStep::Done(TaskOutcome::Completed);
                    }
                    return ConflictStep::Done(self.skip(task, root, SkipReason::InvalidMerge));
                }
            }
        }
    }

    async fn ask_conflict(
        &self,
        task: &Task,
        destination: &Path,
        destination_kind: ItemKind,
    ) -> Result<(ConflictResolution, Option<PathBuf>), OperationError> {
        let target = destination.to_path_buf();
        let proposed = self
            .blocking(move |t| auto_rename_path(&target, |p| t.probe(p).is_some()))
            .await?;

        let context = ConflictContext {
            operation: self.operation,
            source: task.source.clone(),
            destination: destination.to_path_buf(),
            source_kind: task.item,
            destination_kind,
            proposed,
        };
        let (resolution, context) = self.dispatcher.resolve_conflict(context).await;
        Ok((resolution, Some(context.proposed)))
    }

    /// Run the transfer, consulting the error policy on failure.
    async fn attempt(
        &self,
        options: OperationOptions,
        task: &Task,
        destination: Option<PathBuf>,
        clear_first: bool,
        root: &mut RootState,
    ) -> TaskOutcome {
        let kind = task.action.transfer_kind();
        let mut attempt = 1;

        loop {
            let source = task.source.clone();
            let target = destination.clone();
            let result = self
                .blocking(move |t| {
                    if clear_first {
                        if let Some(target) = target.as_deref() {
                            if contains_item(target, &source) {
                                return Err(TransferError::new(
                                    ErrorReason::Other,
                                    target,
                                    "destination contains the item being transferred",
                                ));
                            }
                            if t.probe(target).is_some() {
                                t.clear_destination(target)?;
                            }
                        }
                    }
                    t.transfer_item(&source, target.as_deref(), kind)
                })
                .await;

            let error = match result {
                Ok(Ok(bytes)) => {
                    root.succeeded.insert(task.id);
                    self.record_success(bytes);
                    return TaskOutcome::Completed;
                }
                Ok(Err(error)) => error,
                Err(error) => {
                    self.fail(error);
                    return TaskOutcome::Failed;
                }
            };

            if options.skip_permission_errors && error.reason.is_permission() {
                return self.skip(task, root, SkipReason::PermissionAutoSkip(error));
            }

            let context = ErrorContext::from_transfer(
                self.operation,
                ErrorPhase::Running,
                task.source.clone(),
                destination.clone(),
                &error,
                attempt,
            );
            let decision = self.dispatcher.resolve_error(context).await;
            if self.cancel.is_cancelled() {
                return TaskOutcome::Interrupted;
            }

            match decision {
                ErrorDecision::Retry if attempt <= self.config.max_item_retries => {
                    debug!(path = %task.source.display(), attempt, "Retrying item");
                    attempt += 1;
                }
                ErrorDecision::Skip => {
                    return self.skip(task, root, SkipReason::Error(error));
                }
                ErrorDecision::Retry | ErrorDecision::Abort => {
                    self.fail(OperationError::ItemFailed {
                        operation: self.operation,
                        item: task.source.clone(),
                        error,
                    });
                    return TaskOutcome::Failed;
                }
            }
        }
    }

    fn skip(&self, task: &Task, root: &mut RootState, reason: SkipReason) -> TaskOutcome {
        warn!(path = %task.source.display(), %reason, "Skipping item");
        if task.item.is_dir() && task.action.checks_conflicts() {
            root.pruned.push(task.source.clone());
        }
        root.retained.push(task.source.clone());

        let mut state = self.lock();
        state.skipped += 1;
        state.skipped_items.push(SkippedItem {
            path: task.source.clone(),
            reason,
        });
        TaskOutcome::Skipped
    }

    fn record_success(&self, bytes: u64) {
        let mut state = self.lock();
        state.succeeded += 1;
        state.bytes_transferred += bytes;
    }

    /// Record the first fatal error and stop every root.
    fn fail(&self, error: OperationError) {
        warn!(%error, "Operation failed");
        {
            let mut state = self.lock();
            if state.first_error.is_none() {
                state.first_error = Some(error);
            }
        }
        self.abort.cancel();
    }

    /// Hand a published snapshot to the progress callback.
    async fn notify(&self, snapshot: Option<OperationStatus>) {
        let Some(status) = snapshot else {
            return;
        };
        if !self.dispatcher.on_progress(status).await && !self.cancel.is_cancelled() {
            info!("Progress callback cancelled the operation");
            self.cancel.cancel();
        }
    }

    async fn finish(&self) -> OperationReport {
        let outcome = {
            let mut state = self.lock();
            if state.first_error.is_some() {
                Outcome::Aborted
            } else if self.cancel.is_cancelled() {
                state.first_error = Some(OperationError::Cancelled);
                Outcome::Cancelled
            } else if state.skipped > 0 {
                Outcome::PartialWithSkips
            } else {
                Outcome::Succeeded
            }
        };

        let status = self.publisher.complete(outcome);
        self.notify(Some(status.clone())).await;

        let mut state = self.lock();
        let report = OperationReport {
            operation: self.operation,
            outcome,
            status,
            succeeded: state.succeeded,
            skipped: state.skipped,
            bytes_transferred: state.bytes_transferred,
            skipped_items: std::mem::take(&mut state.skipped_items),
            error: state.first_error.take(),
        };

        info!(
            operation = %self.operation,
            %outcome,
            succeeded = report.succeeded,
            skipped = report.skipped,
            bytes = report.bytes_transferred,
            "Operation complete"
        );
        report
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, OperationError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ItemTransfer) -> T + Send + 'static,
    {
        let transfer = Arc::clone(&self.transfer);
        tokio::task::spawn_blocking(move || f(transfer.as_ref()))
            .await
            .map_err(|e| OperationError::Runtime {
                message: e.to_string(),
            })
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RootState {
    /// Send a directory's descendants wherever the directory itself went.
    fn remember_redirect(&mut self, item: ItemKind, original: &Path, destination: &Path) {
        if item.is_dir() && original != destination {
            self.redirects
                .push((original.to_path_buf(), destination.to_path_buf()));
        }
    }
}

/// Whether `item` is `dir` itself or lies somewhere below it.
fn contains_item(dir: &Path, item: &Path) -> bool {
    resolve(item).starts_with(resolve(dir))
}
