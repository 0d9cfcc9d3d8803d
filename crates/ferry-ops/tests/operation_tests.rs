use ferry_core::{
    ConflictContext, ConflictResolution, Destinations, ErrorContext, ErrorDecision, ErrorPhase,
    ErrorReason, OperationConfig, OperationError, OperationOptions, OperationStatus, Outcome,
    PlanningError, Stage, TransferError,
};
use ferry_ops::{
    FileOperation, FixedPolicy, FsTransfer, ItemTransfer, OperationDelegate, SkipReason,
    TaskAction, TransferKind,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const MB: usize = 1024 * 1024;

/// Filesystem transfer that fails for one file name.
struct FailingTransfer {
    inner: FsTransfer,
    name: &'static str,
    reason: ErrorReason,
    failures_left: AtomicU32,
    calls: AtomicU32,
}

impl FailingTransfer {
    fn new(name: &'static str, reason: ErrorReason, failures: u32) -> Self {
        Self {
            inner: FsTransfer::new(false),
            name,
            reason,
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

impl ItemTransfer for FailingTransfer {
    fn transfer_item(
        &self,
        source: &Path,
        destination: Option<&Path>,
        kind: TransferKind,
    ) -> Result<u64, TransferError> {
        if source.file_name().is_some_and(|n| n == self.name) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(TransferError::new(self.reason, source, "injected failure"));
            }
        }
        self.inner.transfer_item(source, destination, kind)
    }
}

/// Lets a test keep a reference to the transfer it hands to the engine.
struct Shared(Arc<FailingTransfer>);

impl ItemTransfer for Shared {
    fn transfer_item(
        &self,
        source: &Path,
        destination: Option<&Path>,
        kind: TransferKind,
    ) -> Result<u64, TransferError> {
        self.0.transfer_item(source, destination, kind)
    }
}

/// Filesystem transfer that reports everything under `second` as another volume.
struct TwoVolumes {
    inner: FsTransfer,
    second: PathBuf,
}

impl ItemTransfer for TwoVolumes {
    fn transfer_item(
        &self,
        source: &Path,
        destination: Option<&Path>,
        kind: TransferKind,
    ) -> Result<u64, TransferError> {
        self.inner.transfer_item(source, destination, kind)
    }

    fn volume_id(&self, path: &Path) -> Option<u64> {
        Some(if path.starts_with(&self.second) { 2 } else { 1 })
    }
}

/// Delegate that records everything it is asked.
struct Recorder {
    conflict: ConflictResolution,
    error: ErrorDecision,
    stop_when_running: bool,
    conflicts: AtomicUsize,
    errors: Mutex<Vec<ErrorContext>>,
    snapshots: Mutex<Vec<OperationStatus>>,
}

impl Recorder {
    fn new(conflict: ConflictResolution, error: ErrorDecision) -> Self {
        Self {
            conflict,
            error,
            stop_when_running: false,
            conflicts: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
        }
    }
}

impl OperationDelegate for Recorder {
    fn resolve_conflict(&self, _context: &mut ConflictContext) -> ConflictResolution {
        self.conflicts.fetch_add(1, Ordering::SeqCst);
        self.conflict
    }

    fn resolve_error(&self, context: &ErrorContext) -> ErrorDecision {
        self.errors.lock().unwrap().push(context.clone());
        self.error
    }

    fn should_proceed_on_progress(&self, status: &OperationStatus) -> bool {
        self.snapshots.lock().unwrap().push(status.clone());
        !(self.stop_when_running && status.stage == Stage::Running)
    }
}

fn quiet_config() -> OperationConfig {
    OperationConfig::builder()
        .status_change_interval(Duration::ZERO)
        .build()
        .unwrap()
}

fn write_tree(root: &Path) {
    fs::create_dir_all(root.join("b/inner")).unwrap();
    fs::write(root.join("a.txt"), "alpha").unwrap();
    fs::write(root.join("b/c.txt"), "charlie").unwrap();
    fs::write(root.join("b/inner/d.txt"), "delta").unwrap();
}

#[test]
fn test_zero_byte_conflict_without_options_is_unresolved() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("empty");
    let destination = temp.path().join("taken");
    fs::write(&source, "").unwrap();
    fs::write(&destination, "keep me").unwrap();

    let err = FileOperation::new()
        .copy_item_sync(&source, &destination, OperationOptions::default())
        .unwrap_err();

    assert!(matches!(err, OperationError::ConflictUnresolved { .. }));
    assert!(err.to_string().contains("conflict unresolved"));
    assert_eq!(fs::read_to_string(&destination).unwrap(), "keep me");
}

#[test]
fn test_overwrite_three_files() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    fs::create_dir_all(&src).unwrap();
    fs::create_dir_all(&dst).unwrap();

    let mut sources = Vec::new();
    for (name, size) in [("one.bin", MB), ("two.bin", 2 * MB), ("three.bin", 3 * MB)] {
        let path = src.join(name);
        fs::write(&path, vec![7u8; size]).unwrap();
        fs::write(dst.join(name), "stale").unwrap();
        sources.push(path);
    }

    let report = FileOperation::new()
        .copy_sync(
            sources,
            Destinations::Into(dst.clone()),
            OperationOptions::from_bits(OperationOptions::OVERWRITE),
        )
        .unwrap();

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.status.total_bytes, 6 * MB as u64);
    assert_eq!(report.status.total_objects, 3);
    assert_eq!(report.status.completed_bytes, 6 * MB as u64);
    assert_eq!(report.status.completed_objects, 3);
    assert_eq!(report.bytes_transferred, 6 * MB as u64);
    assert_eq!(fs::metadata(dst.join("three.bin")).unwrap().len(), 3 * MB as u64);
}

#[test]
fn test_locked_delete_is_skipped_without_asking() {
    struct Locking(FsTransfer);
    impl ItemTransfer for Locking {
        fn transfer_item(
            &self,
            source: &Path,
            destination: Option<&Path>,
            kind: TransferKind,
        ) -> Result<u64, TransferError> {
            if kind == TransferKind::Delete && source.ends_with("locked.txt") {
                return Err(TransferError::new(ErrorReason::Locked, source, "immutable"));
            }
            self.0.transfer_item(source, destination, kind)
        }
    }

    let temp = TempDir::new().unwrap();
    let victim = temp.path().join("victim");
    fs::create_dir(&victim).unwrap();
    fs::write(victim.join("locked.txt"), "x").unwrap();
    fs::write(victim.join("other.txt"), "y").unwrap();

    let recorder = Arc::new(Recorder::new(ConflictResolution::Quit, ErrorDecision::Abort));
    let report = FileOperation::new()
        .with_shared_delegate(recorder.clone())
        .with_transfer(Locking(FsTransfer::default()))
        .delete_item_sync(
            &victim,
            OperationOptions::default().with_skip_permission_errors(true),
        )
        .unwrap();

    assert_eq!(report.outcome, Outcome::PartialWithSkips);
    assert_eq!(report.skipped, 1);
    assert!(matches!(
        report.skipped_items[0].reason,
        SkipReason::PermissionAutoSkip(TransferError {
            reason: ErrorReason::Locked,
            ..
        })
    ));
    assert!(recorder.errors.lock().unwrap().is_empty());
    assert!(victim.join("locked.txt").exists());
    assert!(!victim.join("other.txt").exists());
    assert!(victim.exists());
}

#[test]
fn test_keep_both_leaves_original() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("src.txt");
    let dst = temp.path().join("dst");
    fs::create_dir(&dst).unwrap();
    fs::write(&source, "new").unwrap();
    fs::write(dst.join("report.txt"), "original").unwrap();
    fs::write(dst.join("report (1).txt"), "also taken").unwrap();

    let report = FileOperation::new()
        .with_delegate(FixedPolicy::new(ConflictResolution::KeepBoth, ErrorDecision::Abort))
        .copy_item_sync(&source, dst.join("report.txt"), OperationOptions::default())
        .unwrap();

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(fs::read_to_string(dst.join("report.txt")).unwrap(), "original");
    assert_eq!(fs::read_to_string(dst.join("report (1).txt")).unwrap(), "also taken");
    assert_eq!(fs::read_to_string(dst.join("report (2).txt")).unwrap(), "new");
}

#[test]
fn test_keep_both_directory_redirects_children() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("photos");
    write_tree(&src);
    let dst = temp.path().join("dst");
    fs::create_dir_all(dst.join("photos")).unwrap();

    FileOperation::new()
        .with_delegate(FixedPolicy::new(ConflictResolution::KeepBoth, ErrorDecision::Abort))
        .copy_sync(vec![src], Destinations::Into(dst.clone()), OperationOptions::default())
        .unwrap();

    assert!(fs::read_dir(dst.join("photos")).unwrap().next().is_none());
    assert_eq!(
        fs::read_to_string(dst.join("photos (1)/b/inner/d.txt")).unwrap(),
        "delta"
    );
}

#[test]
fn test_skip_leaves_item_untouched() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a.txt");
    let destination = temp.path().join("b.txt");
    fs::write(&source, "new").unwrap();
    fs::write(&destination, "old").unwrap();

    let report = FileOperation::new()
        .with_delegate(FixedPolicy::new(ConflictResolution::Skip, ErrorDecision::Abort))
        .move_item_sync(&source, &destination, OperationOptions::default())
        .unwrap();

    assert_eq!(report.outcome, Outcome::PartialWithSkips);
    assert_eq!(report.skipped_items[0].reason, SkipReason::Conflict);
    assert_eq!(fs::read_to_string(&destination).unwrap(), "old");
    assert_eq!(fs::read_to_string(&source).unwrap(), "new");
}

#[test]
fn test_move_directory_tree() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);
    let destination = temp.path().join("moved");

    let report = FileOperation::new()
        .move_item_sync(&src, &destination, OperationOptions::default())
        .unwrap();

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.status.total_objects, 3);
    assert!(!src.exists());
    assert_eq!(fs::read_to_string(destination.join("a.txt")).unwrap(), "alpha");
    assert_eq!(
        fs::read_to_string(destination.join("b/inner/d.txt")).unwrap(),
        "delta"
    );
}

#[test]
fn test_move_conflict_skip_retains_source_directories() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);
    let destination = temp.path().join("moved");
    fs::create_dir_all(destination.join("b")).unwrap();
    fs::write(destination.join("b/c.txt"), "existing").unwrap();

    let report = FileOperation::new()
        .with_delegate(FixedPolicy::new(ConflictResolution::Skip, ErrorDecision::Abort))
        .move_item_sync(&src, &destination, OperationOptions::default())
        .unwrap();

    // Skipping the root prunes the whole tree.
    assert_eq!(report.outcome, Outcome::PartialWithSkips);
    assert!(src.join("a.txt").exists());
    assert!(src.join("b/c.txt").exists());
    assert_eq!(fs::read_to_string(destination.join("b/c.txt")).unwrap(), "existing");
}

#[test]
fn test_merge_directories() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);
    let destination = temp.path().join("merged");
    fs::create_dir_all(destination.join("b")).unwrap();
    fs::write(destination.join("existing.txt"), "kept").unwrap();

    let recorder = Arc::new(Recorder::new(ConflictResolution::Merge, ErrorDecision::Abort));
    let report = FileOperation::new()
        .with_shared_delegate(recorder.clone())
        .move_item_sync(&src, &destination, OperationOptions::default())
        .unwrap();

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(recorder.conflicts.load(Ordering::SeqCst), 2);
    assert!(!src.exists());
    assert_eq!(fs::read_to_string(destination.join("existing.txt")).unwrap(), "kept");
    assert_eq!(fs::read_to_string(destination.join("b/c.txt")).unwrap(), "charlie");
}

#[test]
fn test_merge_on_file_is_skipped() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a.txt");
    let destination = temp.path().join("b.txt");
    fs::write(&source, "new").unwrap();
    fs::write(&destination, "old").unwrap();

    let report = FileOperation::new()
        .with_delegate(FixedPolicy::new(ConflictResolution::Merge, ErrorDecision::Abort))
        .copy_item_sync(&source, &destination, OperationOptions::default())
        .unwrap();

    assert_eq!(report.outcome, Outcome::PartialWithSkips);
    assert_eq!(report.skipped_items[0].reason, SkipReason::InvalidMerge);
    assert_eq!(fs::read_to_string(&destination).unwrap(), "old");
}

#[test]
fn test_replace_directory_with_file() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a.txt");
    let destination = temp.path().join("occupied");
    fs::write(&source, "file").unwrap();
    fs::create_dir_all(destination.join("deep")).unwrap();

    FileOperation::new()
        .copy_item_sync(&source, &destination, OperationOptions::default().with_overwrite(true))
        .unwrap();

    assert!(destination.is_file());
    assert_eq!(fs::read_to_string(&destination).unwrap(), "file");
}

#[test]
fn test_error_policy_abort_keeps_completed_items() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    fs::create_dir(&src).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(src.join(name), name).unwrap();
    }
    let dst = temp.path().join("dst");

    let err = FileOperation::new()
        .with_transfer(FailingTransfer::new("b.txt", ErrorReason::Other, u32::MAX))
        .with_delegate(FixedPolicy::new(ConflictResolution::Quit, ErrorDecision::Abort))
        .copy_item_sync(&src, &dst, OperationOptions::default())
        .unwrap_err();

    assert!(matches!(err, OperationError::ItemFailed { .. }));
    assert!(dst.join("a.txt").exists());
    assert!(!dst.join("b.txt").exists());
    assert!(!dst.join("c.txt").exists());
}

#[test]
fn test_error_policy_skip_continues() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    fs::create_dir(&src).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(src.join(name), name).unwrap();
    }
    let dst = temp.path().join("dst");

    let recorder = Arc::new(Recorder::new(ConflictResolution::Quit, ErrorDecision::Skip));
    let report = FileOperation::new()
        .with_transfer(FailingTransfer::new("b.txt", ErrorReason::NoFreeSpace, u32::MAX))
        .with_shared_delegate(recorder.clone())
        .copy_item_sync(&src, &dst, OperationOptions::default().with_skip_permission_errors(true))
        .unwrap();

    // NoFreeSpace is not a permission error, so the delegate is asked.
    assert_eq!(recorder.errors.lock().unwrap().len(), 1);
    assert_eq!(report.outcome, Outcome::PartialWithSkips);
    assert!(dst.join("c.txt").exists());
    assert!(!dst.join("b.txt").exists());
}

#[test]
fn test_retry_until_success() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("flaky.txt");
    fs::write(&source, "eventually").unwrap();
    let destination = temp.path().join("copy.txt");

    let transfer = Arc::new(FailingTransfer::new("flaky.txt", ErrorReason::NotWritable, 2));
    let recorder = Arc::new(Recorder::new(ConflictResolution::Quit, ErrorDecision::Retry));
    let report = FileOperation::new()
        .with_transfer(Shared(transfer.clone()))
        .with_shared_delegate(recorder.clone())
        .copy_item_sync(&source, &destination, OperationOptions::default())
        .unwrap();

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 3);
    let attempts: Vec<u32> = recorder.errors.lock().unwrap().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(fs::read_to_string(&destination).unwrap(), "eventually");
}

#[test]
fn test_retries_are_bounded() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("broken.txt");
    fs::write(&source, "never").unwrap();

    let transfer = Arc::new(FailingTransfer::new("broken.txt", ErrorReason::Other, u32::MAX));
    let config = OperationConfig::builder().max_item_retries(2u32).build().unwrap();
    let err = FileOperation::with_config(config)
        .with_transfer(Shared(transfer.clone()))
        .with_delegate(FixedPolicy::new(ConflictResolution::Quit, ErrorDecision::Retry))
        .copy_item_sync(&source, temp.path().join("out.txt"), OperationOptions::default())
        .unwrap_err();

    assert!(matches!(err, OperationError::ItemFailed { .. }));
    assert_eq!(transfer.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_missing_source_is_a_planning_error() {
    let temp = TempDir::new().unwrap();
    let err = FileOperation::new()
        .copy_item_sync(
            temp.path().join("missing"),
            temp.path().join("out"),
            OperationOptions::default(),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        OperationError::Planning(PlanningError::SourceNotFound { .. })
    ));
}

#[test]
fn test_cross_volume_move_becomes_copy_then_delete() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src/tree");
    write_tree(&src);
    let dst = temp.path().join("dst");
    fs::create_dir(&dst).unwrap();

    let files = FileOperation::with_config(quiet_config()).with_transfer(TwoVolumes {
        inner: FsTransfer::default(),
        second: dst.clone(),
    });
    let request = ferry_core::OperationRequest::move_to(
        vec![src.clone()],
        Destinations::Into(dst.clone()),
        OperationOptions::default().with_do_not_cross_volumes(true),
    );

    let plan = files.plan(&request).unwrap();
    assert!(plan.roots[0].crosses_volumes);
    let actions: Vec<TaskAction> = plan.tasks().map(|t| t.action).collect();
    assert!(actions[..6].iter().all(|a| *a == TaskAction::Copy));
    assert!(actions[6..].iter().all(|a| *a != TaskAction::Copy));
    assert!(plan.tasks().skip(6).all(|t| t.depends_on.is_some() && t.bytes == 0));
    assert_eq!(plan.total_objects, 3);

    let report = files.run_sync(request).unwrap();
    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.status.completed_objects, 3);
    assert!(!src.exists());
    assert_eq!(fs::read_to_string(dst.join("tree/b/c.txt")).unwrap(), "charlie");
}

#[test]
fn test_cross_volume_failed_copy_retains_source() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src/tree");
    write_tree(&src);
    let dst = temp.path().join("dst");
    fs::create_dir(&dst).unwrap();

    struct FailingSecondVolume(FailingTransfer, PathBuf);
    impl ItemTransfer for FailingSecondVolume {
        fn transfer_item(
            &self,
            source: &Path,
            destination: Option<&Path>,
            kind: TransferKind,
        ) -> Result<u64, TransferError> {
            self.0.transfer_item(source, destination, kind)
        }

        fn volume_id(&self, path: &Path) -> Option<u64> {
            Some(if path.starts_with(&self.1) { 2 } else { 1 })
        }
    }

    let report = FileOperation::new()
        .with_transfer(FailingSecondVolume(
            FailingTransfer::new("c.txt", ErrorReason::NotWritable, u32::MAX),
            dst.clone(),
        ))
        .with_delegate(FixedPolicy::new(ConflictResolution::Quit, ErrorDecision::Skip))
        .move_sync(
            vec![src.clone()],
            Destinations::Into(dst.clone()),
            OperationOptions::default().with_do_not_cross_volumes(true),
        )
        .unwrap();

    assert_eq!(report.outcome, Outcome::PartialWithSkips);
    assert!(src.join("b/c.txt").exists());
    assert!(!src.join("a.txt").exists());
    assert!(!src.join("b/inner").exists());
    assert!(dst.join("tree/a.txt").exists());
}

#[tokio::test]
async fn test_cancel_before_start() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);

    let handle = FileOperation::new().copy_item(&src, temp.path().join("copy"), OperationOptions::default());
    handle.cancel();
    let report = handle.wait().await;

    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(matches!(report.error, Some(OperationError::Cancelled)));
    assert_eq!(report.status.stage, Stage::Complete);
    assert!(!temp.path().join("copy").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_mid_run() {
    struct Slow(FsTransfer);
    impl ItemTransfer for Slow {
        fn transfer_item(
            &self,
            source: &Path,
            destination: Option<&Path>,
            kind: TransferKind,
        ) -> Result<u64, TransferError> {
            std::thread::sleep(Duration::from_millis(20));
            self.0.transfer_item(source, destination, kind)
        }
    }

    let temp = TempDir::new().unwrap();
    let src = temp.path().join("many");
    fs::create_dir(&src).unwrap();
    for i in 0..50 {
        fs::write(src.join(format!("{i:02}.txt")), "x").unwrap();
    }

    let handle = FileOperation::with_config(quiet_config())
        .with_transfer(Slow(FsTransfer::default()))
        .copy_item(&src, temp.path().join("copy"), OperationOptions::default());
    let mut status = handle.subscribe();
    while status.borrow_and_update().completed_objects == 0 {
        status.changed().await.unwrap();
    }
    handle.cancel();
    let report = handle.wait().await;

    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(report.status.completed_objects < report.status.total_objects);
    assert!(report.succeeded < 51);
}

#[tokio::test]
async fn test_stage_sequence_and_counters() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);

    let recorder = Arc::new(Recorder::new(ConflictResolution::Quit, ErrorDecision::Abort));
    let handle = FileOperation::with_config(quiet_config())
        .with_shared_delegate(recorder.clone())
        .copy_item(&src, temp.path().join("copy"), OperationOptions::default());
    let report = handle.wait().await;
    assert_eq!(report.outcome, Outcome::Succeeded);

    let snapshots = recorder.snapshots.lock().unwrap();
    let mut stages: Vec<Stage> = snapshots.iter().map(|s| s.stage).collect();
    stages.dedup();
    assert_eq!(
        stages,
        vec![Stage::Preflighting, Stage::Running, Stage::Complete]
    );

    let mut previous = (0, 0);
    for snapshot in snapshots.iter() {
        assert!(snapshot.completed_bytes <= snapshot.total_bytes);
        assert!(snapshot.completed_objects <= snapshot.total_objects);
        assert!(snapshot.completed_bytes >= previous.0);
        assert!(snapshot.completed_objects >= previous.1);
        previous = (snapshot.completed_bytes, snapshot.completed_objects);
    }

    let last = snapshots.last().unwrap();
    assert_eq!(last.outcome, Some(Outcome::Succeeded));
    assert_eq!(last.completed_objects, 3);
    assert_eq!(last.completed_bytes, 17);
}

#[tokio::test]
async fn test_progress_callback_can_cancel() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);

    let mut recorder = Recorder::new(ConflictResolution::Quit, ErrorDecision::Abort);
    recorder.stop_when_running = true;
    let handle = FileOperation::with_config(quiet_config())
        .with_delegate(recorder)
        .copy_item(&src, temp.path().join("copy"), OperationOptions::default());
    let report = handle.wait().await;

    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.succeeded, 0);
    assert!(!temp.path().join("copy").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_roots() {
    let temp = TempDir::new().unwrap();
    let dst = temp.path().join("dst");
    fs::create_dir(&dst).unwrap();
    let sources: Vec<PathBuf> = (0..4)
        .map(|i| {
            let root = temp.path().join(format!("root{i}"));
            write_tree(&root);
            root
        })
        .collect();

    let config = OperationConfig::builder()
        .max_concurrent_roots(3usize)
        .build()
        .unwrap();
    let report = FileOperation::with_config(config)
        .copy(sources, Destinations::Into(dst.clone()), OperationOptions::default())
        .wait()
        .await;

    assert_eq!(report.outcome, Outcome::Succeeded);
    assert_eq!(report.status.completed_objects, 12);
    for i in 0..4 {
        assert!(dst.join(format!("root{i}/b/inner/d.txt")).exists());
    }
}

#[test]
fn test_report_json() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("a.txt");
    fs::write(&source, "abc").unwrap();

    let report = FileOperation::new()
        .delete_item_sync(&source, OperationOptions::default())
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["outcome"], "Succeeded");
    assert_eq!(json["status"]["stage"], "Complete");
    assert!(json["error"].is_null());
    assert!(!source.exists());
}

#[test]
fn test_overwrite_never_clears_a_directory_holding_the_source() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("dir");
    fs::create_dir(&dir).unwrap();
    let source = dir.join("precious.txt");
    fs::write(&source, "precious").unwrap();
    fs::write(dir.join("sibling.txt"), "sibling").unwrap();

    let err = FileOperation::new()
        .copy_item_sync(&source, &dir, OperationOptions::default().with_overwrite(true))
        .unwrap_err();

    assert!(matches!(
        err,
        OperationError::Planning(PlanningError::SourceInsideDestination { .. })
    ));
    assert_eq!(fs::read_to_string(&source).unwrap(), "precious");
    assert!(dir.join("sibling.txt").exists());
}

#[test]
fn test_replace_never_clears_a_directory_holding_the_source() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("dir");
    fs::create_dir_all(dir.join("nested")).unwrap();
    let source = dir.join("nested/precious.txt");
    fs::write(&source, "precious").unwrap();

    let err = FileOperation::new()
        .with_delegate(FixedPolicy::new(ConflictResolution::Replace, ErrorDecision::Abort))
        .move_item_sync(&source, &dir, OperationOptions::default())
        .unwrap_err();

    assert!(matches!(
        err,
        OperationError::Planning(PlanningError::SourceInsideDestination { .. })
    ));
    assert_eq!(fs::read_to_string(&source).unwrap(), "precious");
}

/// A directory made unlistable for the lifetime of the guard.
#[cfg(unix)]
struct LockedDir(PathBuf);

#[cfg(unix)]
impl LockedDir {
    /// Returns `None` when the process can still list it, as root can.
    fn lock(path: PathBuf) -> Option<Self> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
        let guard = Self(path);
        if fs::read_dir(&guard.0).is_ok() {
            return None;
        }
        Some(guard)
    }
}

#[cfg(unix)]
impl Drop for LockedDir {
    fn drop(&mut self) {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&self.0, fs::Permissions::from_mode(0o755));
    }
}

#[cfg(unix)]
#[test]
fn test_unreadable_subdirectory_skipped_by_delegate() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);
    let Some(_locked) = LockedDir::lock(src.join("b/inner")) else {
        return;
    };
    let dst = temp.path().join("copy");

    let recorder = Arc::new(Recorder::new(ConflictResolution::Quit, ErrorDecision::Skip));
    let report = FileOperation::new()
        .with_shared_delegate(recorder.clone())
        .copy_item_sync(&src, &dst, OperationOptions::default())
        .unwrap();

    let errors = recorder.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].phase, ErrorPhase::Preflighting);
    assert_eq!(errors[0].reason, ErrorReason::NotReadable);
    assert!(errors[0].source.ends_with("b/inner"));

    assert_eq!(report.status.total_objects, 2);
    assert!(dst.join("a.txt").exists());
    assert!(dst.join("b/c.txt").exists());
    assert!(!dst.join("b/inner").exists());
}

#[cfg(unix)]
#[test]
fn test_unreadable_subdirectory_aborts_before_running() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);
    let Some(_locked) = LockedDir::lock(src.join("b/inner")) else {
        return;
    };
    let dst = temp.path().join("copy");

    let recorder = Arc::new(Recorder::new(ConflictResolution::Quit, ErrorDecision::Abort));
    let err = FileOperation::with_config(quiet_config())
        .with_shared_delegate(recorder.clone())
        .copy_item_sync(&src, &dst, OperationOptions::default())
        .unwrap_err();

    assert!(matches!(
        err,
        OperationError::Planning(PlanningError::Unreadable { .. })
    ));
    assert_eq!(recorder.errors.lock().unwrap().len(), 1);
    let snapshots = recorder.snapshots.lock().unwrap();
    assert!(snapshots.iter().all(|s| s.stage != Stage::Running));
    assert!(!dst.exists());
}

#[cfg(unix)]
#[test]
fn test_unreadable_subdirectory_auto_skipped_without_asking() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    write_tree(&src);
    let Some(_locked) = LockedDir::lock(src.join("b/inner")) else {
        return;
    };
    let dst = temp.path().join("copy");

    let recorder = Arc::new(Recorder::new(ConflictResolution::Quit, ErrorDecision::Abort));
    FileOperation::new()
        .with_shared_delegate(recorder.clone())
        .copy_item_sync(
            &src,
            &dst,
            OperationOptions::default().with_skip_permission_errors(true),
        )
        .unwrap();

    assert!(recorder.errors.lock().unwrap().is_empty());
    assert!(dst.join("b/c.txt").exists());
    assert!(!dst.join("b/inner").exists());
}
