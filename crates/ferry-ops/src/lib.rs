//! File operation engine for ferry.
//!
//! This crate turns copy, move and delete requests into ordered single-item
//! tasks and runs them on Tokio with conflict resolution, per-item error
//! policy, cancellation and throttled progress snapshots.
//!
//! ```no_run
//! use ferry_ops::{FileOperation, FixedPolicy};
//! use ferry_core::{ConflictResolution, ErrorDecision, OperationOptions};
//!
//! let files = FileOperation::new()
//!     .with_delegate(FixedPolicy::new(ConflictResolution::KeepBoth, ErrorDecision::Skip));
//! let report = files.copy_item_sync("notes.txt", "backup/notes.txt", OperationOptions::default())?;
//! println!("{}", report.summary());
//! # Ok::<(), ferry_core::OperationError>(())
//! ```

mod conflict;
mod delegate;
mod executor;
mod handle;
mod operation;
mod planner;
mod progress;
mod report;
mod transfer;

pub use conflict::auto_rename_path;
pub use delegate::{FixedPolicy, OperationDelegate};
pub use handle::OperationHandle;
pub use operation::FileOperation;
pub use planner::{Plan, RootPlan, Task, TaskAction, TaskId};
pub use report::{OperationReport, SkipReason, SkippedItem};
pub use transfer::{FsTransfer, ItemTransfer, TransferKind};
