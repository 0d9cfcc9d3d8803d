//! Expansion of a request into an ordered list of single-item tasks.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ferry_core::{
    ErrorContext, ErrorDecision, ErrorPhase, ErrorReason, ItemKind, OperationKind,
    OperationOptions, OperationRequest, PlanningError, TransferError,
};
use jwalk::{Parallelism, WalkDir};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delegate::Dispatcher;
use crate::transfer::{ItemTransfer, TransferKind};

/// Position of a task in its plan.
pub type TaskId = usize;

/// What a task does to its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskAction {
    Copy,
    Move,
    Delete,
    /// Remove a source directory emptied by a move.
    RemoveSourceDirectory,
}

impl TaskAction {
    /// The primitive operation carried out for this action.
    pub fn transfer_kind(&self) -> TransferKind {
        match self {
            Self::Copy => TransferKind::Copy,
            Self::Move => TransferKind::Move,
            Self::Delete | Self::RemoveSourceDirectory => TransferKind::Delete,
        }
    }

    /// Whether the task writes to a destination that may already be occupied.
    pub fn checks_conflicts(&self) -> bool {
        matches!(self, Self::Copy | Self::Move)
    }
}

/// One planned unit of work for exactly one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Index of the root this task belongs to.
    pub root: usize,
    pub action: TaskAction,
    pub item: ItemKind,
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    /// Bytes this task adds to the completed counter.
    pub bytes: u64,
    /// Whether this task adds one to the completed object counter.
    pub counts_as_object: bool,
    /// A task that must have succeeded before this one runs.
    pub depends_on: Option<TaskId>,
}

impl Task {
    /// Objects this task adds to the completed counter.
    pub fn objects(&self) -> u64 {
        u64::from(self.counts_as_object)
    }
}

/// The tasks of one (source, destination) pair, in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootPlan {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    /// Source and destination parent live on different volumes.
    pub crosses_volumes: bool,
    pub tasks: Vec<Task>,
}

/// An inspectable plan for a whole request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub operation: OperationKind,
    pub options: OperationOptions,
    pub roots: Vec<RootPlan>,
    pub total_bytes: u64,
    pub total_objects: u64,
}

impl Plan {
    /// All tasks, root by root.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.roots.iter().flat_map(|root| root.tasks.iter())
    }

    pub fn task_count(&self) -> usize {
        self.roots.iter().map(|root| root.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }
}

/// A walked item, relative to its root.
#[derive(Debug)]
struct Entry {
    path: PathBuf,
    relative: PathBuf,
    item: ItemKind,
    bytes: u64,
}

/// Builds [`Plan`]s. Runs on a blocking thread.
pub(crate) struct OperationPlanner {
    transfer: Arc<dyn ItemTransfer>,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl OperationPlanner {
    pub(crate) fn new(
        transfer: Arc<dyn ItemTransfer>,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transfer,
            dispatcher,
            cancel,
        }
    }

    pub(crate) fn plan(&self, request: &OperationRequest) -> Result<Plan, PlanningError> {
        let operation = request.kind();
        let options = request.options();
        let pairs = request.pairs()?;

        let mut roots = Vec::with_capacity(pairs.len());
        let mut next_id = 0;
        for (index, (source, destination)) in pairs.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(PlanningError::Cancelled);
            }
            validate_root(&source, destination.as_deref())?;
            let root = self.plan_root(index, operation, options, source, destination, &mut next_id)?;
            roots.push(root);
        }

        let total_bytes: u64 = roots.iter().flat_map(|r| &r.tasks).map(|t| t.bytes).sum();
        let total_objects: u64 = roots.iter().flat_map(|r| &r.tasks).map(Task::objects).sum();

        info!(
            %operation,
            roots = roots.len(),
            total_bytes,
            total_objects,
            "Planned operation"
        );

        Ok(Plan {
            operation,
            options,
            roots,
            total_bytes,
            total_objects,
        })
    }

    fn plan_root(
        &self,
        index: usize,
        operation: OperationKind,
        options: OperationOptions,
        source: PathBuf,
        destination: Option<PathBuf>,
        next_id: &mut TaskId,
    ) -> Result<RootPlan, PlanningError> {
        let entries = self.walk(operation, options, &source)?;

        let crosses_volumes = match &destination {
            Some(destination) => {
                let source_volume = self.transfer.volume_id(&source);
                let destination_volume = self.transfer.volume_id(&parent_of(destination));
                match (source_volume, destination_volume) {
                    (Some(a), Some(b)) => a != b,
                    _ => false,
                }
            }
            None => false,
        };

        let mut builder = TaskBuilder {
            root: index,
            destination: destination.as_deref(),
            next_id,
            tasks: Vec::with_capacity(entries.len()),
        };

        match operation {
            OperationKind::Copy => {
                for entry in &entries {
                    builder.push(TaskAction::Copy, entry, true, None);
                }
            }
            OperationKind::Move if crosses_volumes && options.do_not_cross_volumes => {
                debug!(source = %source.display(), "Splitting cross-volume move into copy and delete");
                let copies: Vec<TaskId> = entries
                    .iter()
                    .map(|entry| builder.push(TaskAction::Copy, entry, true, None))
                    .collect();
                for i in post_order(&entries) {
                    let action = if entries[i].item.is_dir() {
                        TaskAction::RemoveSourceDirectory
                    } else {
                        TaskAction::Delete
                    };
                    builder.push(action, &entries[i], false, Some(copies[i]));
                }
            }
            OperationKind::Move => {
                for entry in &entries {
                    builder.push(TaskAction::Move, entry, true, None);
                }
                for i in post_order(&entries) {
                    if entries[i].item.is_dir() {
                        builder.push(TaskAction::RemoveSourceDirectory, &entries[i], false, None);
                    }
                }
            }
            OperationKind::Delete => {
                for i in post_order(&entries) {
                    builder.push(TaskAction::Delete, &entries[i], true, None);
                }
            }
        }

        let tasks = builder.tasks;
        debug!(source = %source.display(), tasks = tasks.len(), crosses_volumes, "Planned root");

        Ok(RootPlan {
            source,
            destination,
            crosses_volumes,
            tasks,
        })
    }

    /// Walk a root in lexicographic pre-order without following symlinks.
    fn walk(
        &self,
        operation: OperationKind,
        options: OperationOptions,
        root: &Path,
    ) -> Result<Vec<Entry>, PlanningError> {
        let metadata = fs::symlink_metadata(root).map_err(|e| PlanningError::io(root, e))?;
        let item = ItemKind::from_file_type(&metadata.file_type());
        if !item.is_dir() {
            return Ok(vec![Entry {
                path: root.to_path_buf(),
                relative: PathBuf::new(),
                item,
                bytes: file_bytes(item, &metadata),
            }]);
        }

        let walker = WalkDir::new(root)
            .parallelism(Parallelism::Serial)
            .sort(true)
            .skip_hidden(false)
            .follow_links(false);

        let mut entries = Vec::new();
        let mut failures: Vec<TransferError> = Vec::new();

        for entry_result in walker {
            if self.cancel.is_cancelled() {
                return Err(PlanningError::Cancelled);
            }

            let entry = match entry_result {
                Ok(e) => e,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    failures.push(walk_failure(path, &err));
                    continue;
                }
            };

            let path = entry.path();
            if let Some(err) = &entry.read_children_error {
                failures.push(walk_failure(path, err));
                continue;
            }

            let item = ItemKind::from_file_type(&entry.file_type());
            let bytes = if item == ItemKind::File {
                match entry.metadata() {
                    Ok(metadata) => metadata.len(),
                    Err(err) => {
                        failures.push(walk_failure(path, &err));
                        continue;
                    }
                }
            } else {
                0
            };

            let Ok(relative) = path.strip_prefix(root).map(Path::to_path_buf) else {
                continue;
            };
            entries.push(Entry {
                path,
                relative,
                item,
                bytes,
            });
        }

        for failure in failures {
            if !self.proceed_after_walk_error(operation, options, &failure) {
                return Err(PlanningError::Unreadable {
                    path: failure.path,
                    message: failure.message,
                });
            }
            warn!(path = %failure.path.display(), reason = %failure.reason, "Omitting unreadable entry");
            entries.retain(|entry| !entry.path.starts_with(&failure.path));
        }

        entries.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(entries)
    }

    fn proceed_after_walk_error(
        &self,
        operation: OperationKind,
        options: OperationOptions,
        failure: &TransferError,
    ) -> bool {
        if options.skip_permission_errors && failure.reason.is_permission() {
            return true;
        }
        let context = ErrorContext::from_transfer(
            operation,
            ErrorPhase::Preflighting,
            failure.path.clone(),
            None,
            failure,
            1,
        );
        // A walk cannot be resumed at one entry, so a retry omits it like a skip.
        self.dispatcher.resolve_error_blocking(&context) != ErrorDecision::Abort
    }
}

/// Classify a walk error against the entry it belongs to.
fn walk_failure(path: PathBuf, error: &jwalk::Error) -> TransferError {
    match error.io_error() {
        Some(io) => TransferError::from_io(path, io, ErrorReason::NotReadable),
        None => TransferError::new(ErrorReason::Other, path, error.to_string()),
    }
}

struct TaskBuilder<'a> {
    root: usize,
    destination: Option<&'a Path>,
    next_id: &'a mut TaskId,
    tasks: Vec<Task>,
}

impl TaskBuilder<'_> {
    fn push(
        &mut self,
        action: TaskAction,
        entry: &Entry,
        contributes: bool,
        depends_on: Option<TaskId>,
    ) -> TaskId {
        let id = *self.next_id;
        *self.next_id += 1;

        let destination = match action {
            TaskAction::Copy | TaskAction::Move => self
                .destination
                .map(|root| destination_for(root, &entry.relative)),
            TaskAction::Delete | TaskAction::RemoveSourceDirectory => None,
        };

        self.tasks.push(Task {
            id,
            root: self.root,
            action,
            item: entry.item,
            source: entry.path.clone(),
            destination,
            bytes: if contributes { entry.bytes } else { 0 },
            counts_as_object: contributes && !entry.item.is_dir(),
            depends_on,
        });
        id
    }
}

/// Check one (source, destination) pair before anything is walked.
fn validate_root(source: &Path, destination: Option<&Path>) -> Result<(), PlanningError> {
    let metadata = fs::symlink_metadata(source).map_err(|e| PlanningError::io(source, e))?;

    let Some(destination) = destination else {
        return Ok(());
    };

    let resolved_source = resolve(source);
    let resolved_destination = resolve(destination);
    if resolved_source == resolved_destination {
        return Err(PlanningError::SameItem {
            path: source.to_path_buf(),
        });
    }
    if resolved_source.starts_with(&resolved_destination) {
        return Err(PlanningError::SourceInsideDestination {
            item: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });
    }

    let parent = parent_of(destination);
    match fs::metadata(&parent) {
        Ok(parent_metadata) if parent_metadata.is_dir() => {
            // Best effort: only a parent with every write bit cleared is caught
            // here. Access denied for this process surfaces from the transfer.
            if parent_metadata.permissions().readonly() {
                return Err(PlanningError::DestinationNotWritable { path: parent });
            }
        }
        _ => return Err(PlanningError::DestinationParentMissing { path: parent }),
    }

    if metadata.is_dir() && resolved_destination.starts_with(&resolved_source) {
        return Err(PlanningError::DestinationInsideSource {
            item: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });
    }

    Ok(())
}

/// Canonicalize the parent of `path` and re-attach the final component, so the
/// item itself need not exist and a symlink is not followed.
pub(crate) fn resolve(path: &Path) -> PathBuf {
    match path.file_name() {
        Some(name) => fs::canonicalize(parent_of(path))
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        None => fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

fn parent_of(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn destination_for(root: &Path, relative: &Path) -> PathBuf {
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

fn file_bytes(item: ItemKind, metadata: &fs::Metadata) -> u64 {
    if item == ItemKind::File { metadata.len() } else { 0 }
}

/// Indices of pre-ordered entries rearranged so every directory follows its
/// descendants. Siblings keep their order.
fn post_order(entries: &[Entry]) -> Vec<usize> {
    let mut order = Vec::with_capacity(entries.len());
    let mut open: Vec<usize> = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        while let Some(&top) = open.last() {
            let dir = &entries[top].relative;
            if entry.relative != *dir && entry.relative.starts_with(dir) {
                break;
            }
            order.push(top);
            open.pop();
        }
        if entry.item.is_dir() {
            open.push(i);
        } else {
            order.push(i);
        }
    }
    while let Some(top) = open.pop() {
        order.push(top);
    }
    order
}
