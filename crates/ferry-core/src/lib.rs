//! Core types for ferry.
//!
//! This crate provides the data model shared by the engine and its callers:
//! operation requests and options, progress snapshots, the conflict and error
//! contexts handed to decision callbacks, the error taxonomy, and configuration.

mod config;
mod decision;
mod error;
mod operation;
mod status;

pub use config::{OperationConfig, OperationConfigBuilder};
pub use decision::{
    ConflictContext, ConflictResolution, ErrorContext, ErrorDecision, ErrorPhase, ErrorReason,
    ItemKind,
};
pub use error::{OperationError, PlanningError, TransferError};
pub use operation::{Destinations, OperationKind, OperationOptions, OperationRequest};
pub use status::{OperationStatus, Outcome, Stage};
