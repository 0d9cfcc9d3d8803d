//! Status ownership and snapshot publishing.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ferry_core::{OperationKind, OperationStatus, Outcome, Stage};
use tokio::sync::watch;
use tracing::debug;

use crate::planner::Plan;

/// Number of rate samples averaged into the reported throughput.
const THROUGHPUT_WINDOW: usize = 4;

/// Rolling average of the byte rate between publishes.
#[derive(Debug, Default)]
pub(crate) struct ThroughputMeter {
    last: Option<(Instant, u64)>,
    samples: VecDeque<f64>,
}

impl ThroughputMeter {
    /// Record the completed byte count at `now` and return the current rate.
    pub(crate) fn sample(&mut self, completed: u64, now: Instant) -> f64 {
        if let Some((at, bytes)) = self.last {
            let secs = now.saturating_duration_since(at).as_secs_f64();
            if secs > 0.0 {
                let rate = completed.saturating_sub(bytes) as f64 / secs;
                self.samples.push_back(rate);
                if self.samples.len() > THROUGHPUT_WINDOW {
                    self.samples.pop_front();
                }
            }
        }
        self.last = Some((now, completed));

        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }
}

struct PublisherState {
    status: OperationStatus,
    last_publish: Option<Instant>,
    meter: ThroughputMeter,
}

/// Sole writer of an operation's status.
///
/// Every method that publishes returns the published snapshot so the caller
/// can hand it to the progress callback.
pub(crate) struct StatusPublisher {
    sender: watch::Sender<OperationStatus>,
    state: Mutex<PublisherState>,
    interval: Duration,
}

impl StatusPublisher {
    pub(crate) fn new(
        operation: OperationKind,
        interval: Duration,
    ) -> (Self, watch::Receiver<OperationStatus>) {
        let status = OperationStatus::new(operation);
        let (sender, receiver) = watch::channel(status.clone());
        let publisher = Self {
            sender,
            state: Mutex::new(PublisherState {
                status,
                last_publish: None,
                meter: ThroughputMeter::default(),
            }),
            interval,
        };
        (publisher, receiver)
    }

    /// Move to `stage` if that is a forward transition.
    pub(crate) fn transition(&self, stage: Stage) -> Option<OperationStatus> {
        let mut state = self.lock();
        if !state.status.stage.can_advance_to(stage) {
            return None;
        }
        debug!(from = %state.status.stage, to = %stage, "Stage transition");
        state.status.stage = stage;
        Some(self.publish(&mut state, Instant::now()))
    }

    /// Fix the totals from a finished plan and enter [`Stage::Running`].
    pub(crate) fn begin_running(&self, plan: &Plan) -> Option<OperationStatus> {
        {
            let mut state = self.lock();
            state.status.total_bytes = plan.total_bytes;
            state.status.total_objects = plan.total_objects;
        }
        self.transition(Stage::Running)
    }

    /// Record the root and item being processed. Not published on its own.
    pub(crate) fn set_current(
        &self,
        source_path: PathBuf,
        destination_path: Option<PathBuf>,
        source_item: PathBuf,
        destination_item: Option<PathBuf>,
    ) {
        let mut state = self.lock();
        state.status.source_path = Some(source_path);
        state.status.destination_path = destination_path;
        state.status.source_item = Some(source_item);
        state.status.destination_item = destination_item;
    }

    /// Add a finished task's contribution, publishing when the interval has
    /// elapsed or `force` is set.
    pub(crate) fn advance(&self, bytes: u64, objects: u64, force: bool) -> Option<OperationStatus> {
        let mut state = self.lock();
        let status = &mut state.status;
        status.completed_bytes = status.completed_bytes.saturating_add(bytes).min(status.total_bytes);
        status.completed_objects = status
            .completed_objects
            .saturating_add(objects)
            .min(status.total_objects);

        let now = Instant::now();
        let due = match state.last_publish {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        (force || due).then(|| self.publish(&mut state, now))
    }

    /// Enter [`Stage::Complete`] with `outcome` and publish the final snapshot.
    pub(crate) fn complete(&self, outcome: Outcome) -> OperationStatus {
        let mut state = self.lock();
        state.status.stage = Stage::Complete;
        state.status.outcome = Some(outcome);
        state.status.source_item = None;
        state.status.destination_item = None;
        self.publish(&mut state, Instant::now())
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> OperationStatus {
        self.lock().status.clone()
    }

    fn publish(&self, state: &mut PublisherState, now: Instant) -> OperationStatus {
        let completed = state.status.completed_bytes;
        state.status.throughput = state.meter.sample(completed, now);
        state.last_publish = Some(now);
        let snapshot = state.status.clone();
        self.sender.send_replace(snapshot.clone());
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
