//! Engine configuration types.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Tuning knobs for running file operations.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct OperationConfig {
    /// Minimum time between published status snapshots.
    ///
    /// Stage changes and the final snapshot are always published.
    #[builder(default = "Duration::from_millis(500)")]
    #[serde(default = "default_status_change_interval")]
    pub status_change_interval: Duration,

    /// Number of top-level sources processed at the same time.
    #[builder(default = "1")]
    #[serde(default = "default_max_concurrent_roots")]
    pub max_concurrent_roots: usize,

    /// How many times one item may be retried before the retry counts as abort.
    #[builder(default = "3")]
    #[serde(default = "default_max_item_retries")]
    pub max_item_retries: u32,

    /// Flush copied file contents to disk before publishing them.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub sync_writes: bool,
}

fn default_status_change_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_concurrent_roots() -> usize {
    1
}

fn default_max_item_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl OperationConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_roots == Some(0) {
            return Err("max_concurrent_roots must be at least 1".to_string());
        }
        Ok(())
    }
}

impl OperationConfig {
    /// Create a new config builder.
    pub fn builder() -> OperationConfigBuilder {
        OperationConfigBuilder::default()
    }
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            status_change_interval: default_status_change_interval(),
            max_concurrent_roots: default_max_concurrent_roots(),
            max_item_retries: default_max_item_retries(),
            sync_writes: true,
        }
    }
}
