//! Caller-supplied decisions for conflicts, errors and progress.

use std::sync::{Arc, Mutex, PoisonError};

use ferry_core::{
    ConflictContext, ConflictResolution, ErrorContext, ErrorDecision, OperationStatus,
};
use tracing::warn;

/// Receives decision requests while an operation runs.
///
/// Every method is optional. The defaults fail closed: conflicts quit the
/// operation and errors abort it. Calls are serialized and made from the
/// blocking pool, so an implementation may block while it waits for a user.
pub trait OperationDelegate: Send + Sync {
    /// Decide what to do about an occupied destination.
    ///
    /// For [`ConflictResolution::KeepBoth`], the item is written to
    /// `context.proposed`, which may be changed here.
    fn resolve_conflict(&self, context: &mut ConflictContext) -> ConflictResolution {
        let _ = context;
        ConflictResolution::Quit
    }

    /// Whether to skip the failed item and continue.
    fn should_proceed_after_error(&self, context: &ErrorContext) -> bool {
        let _ = context;
        false
    }

    /// Decide what to do about a failed item.
    ///
    /// Override this to request a retry; by default the answer of
    /// [`should_proceed_after_error`](Self::should_proceed_after_error) is used.
    fn resolve_error(&self, context: &ErrorContext) -> ErrorDecision {
        self.should_proceed_after_error(context).into()
    }

    /// Observe a published status snapshot. Returning false cancels the
    /// operation.
    fn should_proceed_on_progress(&self, status: &OperationStatus) -> bool {
        let _ = status;
        true
    }
}

/// A delegate that gives the same answer to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedPolicy {
    /// Answer to every conflict.
    pub conflict: ConflictResolution,
    /// Answer to every error.
    pub error: ErrorDecision,
}

impl FixedPolicy {
    pub fn new(conflict: ConflictResolution, error: ErrorDecision) -> Self {
        Self { conflict, error }
    }
}

impl Default for FixedPolicy {
    fn default() -> Self {
        Self::new(ConflictResolution::Quit, ErrorDecision::Abort)
    }
}

impl OperationDelegate for FixedPolicy {
    fn resolve_conflict(&self, _context: &mut ConflictContext) -> ConflictResolution {
        self.conflict
    }

    fn should_proceed_after_error(&self, _context: &ErrorContext) -> bool {
        self.error == ErrorDecision::Skip
    }

    fn resolve_error(&self, _context: &ErrorContext) -> ErrorDecision {
        self.error
    }
}

/// Single dispatch point for delegate calls.
///
/// Holds the gate for the duration of each call so a delegate never sees two
/// requests at once, even with several roots in flight.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    delegate: Option<Arc<dyn OperationDelegate>>,
    gate: Arc<Mutex<()>>,
}

impl Dispatcher {
    pub(crate) fn new(delegate: Option<Arc<dyn OperationDelegate>>) -> Self {
        Self {
            delegate,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Ask for a conflict resolution. Returns the context as the delegate
    /// left it.
    pub(crate) async fn resolve_conflict(
        &self,
        context: ConflictContext,
    ) -> (ConflictResolution, ConflictContext) {
        let fallback = (ConflictResolution::Quit, context.clone());
        self.call(fallback, move |delegate| {
            let mut context = context;
            let resolution = delegate.resolve_conflict(&mut context);
            (resolution, context)
        })
        .await
    }

    pub(crate) async fn resolve_error(&self, context: ErrorContext) -> ErrorDecision {
        self.call(ErrorDecision::Abort, move |delegate| {
            delegate.resolve_error(&context)
        })
        .await
    }

    pub(crate) async fn on_progress(&self, status: OperationStatus) -> bool {
        self.call(true, move |delegate| {
            delegate.should_proceed_on_progress(&status)
        })
        .await
    }

    /// Ask for an error decision from a thread that may block.
    pub(crate) fn resolve_error_blocking(&self, context: &ErrorContext) -> ErrorDecision {
        match &self.delegate {
            Some(delegate) => {
                let _guard = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
                delegate.resolve_error(context)
            }
            None => ErrorDecision::Abort,
        }
    }

    async fn call<T, F>(&self, fallback: T, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&dyn OperationDelegate) -> T + Send + 'static,
    {
        let Some(delegate) = self.delegate.clone() else {
            return fallback;
        };
        let gate = Arc::clone(&self.gate);

        let result = tokio::task::spawn_blocking(move || {
            let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
            f(delegate.as_ref())
        })
        .await;

        match result {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Delegate call failed");
                fallback
            }
        }
    }
}
