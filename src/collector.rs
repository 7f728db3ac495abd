//! Collector Layer
//!
//! Owns the set of active polling jobs and drives their recurring execution.
//!
//! # Architecture
//!
//! - [`JobRegistry`]: authoritative in-memory set of enabled metric jobs
//! - [`IntervalGroup`]: jobs sharing one interval, grouped per device
//! - [`IntervalScheduler`]: one timer per distinct interval, re-derived as the
//!   registry changes
//! - [`JobSource`]: where the registry reloads its jobs from
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = Arc::new(JobRegistry::new(Arc::new(storage.provisions.clone())));
//! registry.refresh().await?;
//! let scheduler = Arc::new(IntervalScheduler::new(registry, dispatch, aggregator).await?);
//! scheduler.refresh().await?;
//! scheduler.start().await?;
//! ```

mod registry;
mod scheduler;
mod traits;

pub use registry::{DeviceJobs, IntervalGroup, JobRegistry};
pub use scheduler::{
    DEFAULT_REFRESH_INTERVAL, IntervalScheduler, RefreshOutcome, SchedulerConfig,
};
pub use traits::{CollectorError, JobSource, MAX_INTERVAL, MIN_INTERVAL, clamp_interval};
