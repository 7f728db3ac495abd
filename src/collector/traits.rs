//! Core collector traits and types.

use std::time::Duration;

use thiserror::Error;

use crate::model::MetricJob;
use crate::storage::StorageError;

/// Minimum allowed polling interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum allowed polling interval (365 days).
///
/// Timer arithmetic overflows on durations far beyond this.
pub const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Errors that can occur while maintaining or scheduling jobs.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Loading jobs from persistence failed.
    #[error("failed to load jobs: {0}")]
    Storage(#[from] StorageError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// Clamp a polling interval (seconds) to [`MIN_INTERVAL`]..=[`MAX_INTERVAL`].
pub fn clamp_interval(secs: u64) -> u64 {
    let min = MIN_INTERVAL.as_secs();
    let max = MAX_INTERVAL.as_secs();
    if secs < min {
        tracing::warn!(min_interval = ?MIN_INTERVAL,
            "Interval duration is less than minimum allowed. Using minimum duration."
        );
        min
    } else if secs > max {
        tracing::warn!(interval_secs = secs, max_interval = ?MAX_INTERVAL,
            "Interval duration exceeds maximum allowed. Using maximum duration."
        );
        max
    } else {
        secs
    }
}

/// Source of the authoritative set of enabled metric jobs.
///
/// # Error Handling
///
/// An `Err` means the set could not be loaded at all; callers keep their
/// previous state. Individual rows that cannot be decoded are skipped by the
/// implementation rather than failing the whole load.
#[async_trait::async_trait]
pub trait JobSource: Send + Sync + 'static {
    /// Load every enabled job.
    async fn load_enabled_jobs(&self) -> Result<Vec<MetricJob>, StorageError>;
}
