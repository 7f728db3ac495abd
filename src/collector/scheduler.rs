//! Interval scheduler.
//!
//! Keeps exactly one repeated timer per distinct polling interval present in
//! the [`JobRegistry`]. Timers run on `tokio-cron-scheduler`; on each firing
//! the interval's group is snapshotted and one polling request per device is
//! handed to the plugin dispatcher.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::aggregator::AggregatorHandle;
use crate::collector::{CollectorError, JobRegistry, MAX_INTERVAL};
use crate::plugin::Dispatch;
use crate::storage::{Event, EventKind, EventSeverity};

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default period of the registry/timer reconciliation pass.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Static event source tag for scheduler events.
const SCHEDULER_EVENT_SOURCE: &str = "collector.scheduler";

fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the reconciliation pass (default: 10s).
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Intervals that gained a timer.
    pub started: Vec<u64>,
    /// Intervals whose timer was cancelled.
    pub cancelled: Vec<u64>,
}

/// One timer per distinct polling interval.
pub struct IntervalScheduler {
    scheduler: JobScheduler,
    registry: Arc<JobRegistry>,
    dispatch: Arc<dyn Dispatch>,
    events: AggregatorHandle,
    /// interval seconds → timer id. Locked for the whole refresh pass.
    timers: Mutex<BTreeMap<u64, Uuid>>,
}

impl std::fmt::Debug for IntervalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalScheduler")
            .field(
                "timer_count",
                &self.timers.try_lock().map(|t| t.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl IntervalScheduler {
    /// Create a scheduler. Timers only fire after [`start`](Self::start).
    pub async fn new(
        registry: Arc<JobRegistry>,
        dispatch: Arc<dyn Dispatch>,
        events: AggregatorHandle,
    ) -> Result<Self, CollectorError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            registry,
            dispatch,
            events,
            timers: Mutex::new(BTreeMap::new()),
        })
    }

    /// Start the underlying job scheduler.
    pub async fn start(&self) -> Result<(), CollectorError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| CollectorError::Scheduler(e.to_string()))?;
        self.emit_info("Interval scheduler started", serde_json::json!({}));
        tracing::info!("Interval scheduler started");
        Ok(())
    }

    /// Intervals that currently own a timer, ascending.
    pub async fn active_intervals(&self) -> Vec<u64> {
        self.timers.lock().await.keys().copied().collect()
    }

    pub async fn timer_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    /// Reconcile timers with the registry's current interval set.
    ///
    /// Failures on individual timers are logged and do not stop the pass;
    /// the last one is returned after every interval has been handled.
    pub async fn refresh(&self) -> Result<RefreshOutcome, CollectorError> {
        let mut timers = self.timers.lock().await;
        let wanted: BTreeSet<u64> = self.registry.intervals().await.into_iter().collect();
        let mut outcome = RefreshOutcome::default();
        let mut last_err = None;

        let stale: Vec<(u64, Uuid)> = timers
            .iter()
            .filter(|(interval, _)| !wanted.contains(interval))
            .map(|(interval, id)| (*interval, *id))
            .collect();
        for (interval, id) in stale {
            match self.scheduler.remove(&id).await {
                Ok(()) => {
                    timers.remove(&interval);
                    outcome.cancelled.push(interval);
                    self.emit_info(
                        format!("Timer for {interval}s cancelled"),
                        serde_json::json!({ "interval_secs": interval, "timer_id": id.to_string() }),
                    );
                    tracing::info!(interval_secs = interval, "Timer cancelled");
                }
                Err(e) => {
                    let err = CollectorError::Scheduler(e.to_string());
                    self.emit_timer_error(interval, &err, "cancel");
                    last_err = Some(err);
                }
            }
        }

        for interval in wanted {
            if timers.contains_key(&interval) {
                continue;
            }
            let added = match self.create_timer(interval) {
                Ok(job) => self
                    .scheduler
                    .add(job)
                    .await
                    .map_err(|e| CollectorError::Scheduler(e.to_string())),
                Err(e) => Err(e),
            };
            match added {
                Ok(id) => {
                    timers.insert(interval, id);
                    outcome.started.push(interval);
                    self.emit_info(
                        format!("Timer for {interval}s started"),
                        serde_json::json!({ "interval_secs": interval, "timer_id": id.to_string() }),
                    );
                    tracing::info!(interval_secs = interval, timer_id = %id, "Timer started");
                }
                Err(e) => {
                    self.emit_timer_error(interval, &e, "start");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Fire one interval immediately, as its timer would.
    ///
    /// Returns the number of requests dispatched.
    pub async fn fire(&self, interval_secs: u64) -> usize {
        run_tick(interval_secs, &self.registry, self.dispatch.as_ref()).await
    }

    /// Spawn the periodic reconciliation loop.
    ///
    /// Each period first rebuilds the registry from persistence; registry
    /// mutations that change the interval set trigger an extra pass.
    pub fn spawn_refresh_loop(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let changes = this.registry.interval_changes();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.registry.refresh().await {
                            tracing::warn!(error = %e, "Registry refresh failed, keeping current jobs");
                        }
                    }
                    _ = changes.notified() => {}
                }
                if let Err(e) = this.refresh().await {
                    tracing::error!(error = %e, "Timer refresh failed");
                }
            }
        })
    }

    /// Gracefully shutdown the scheduler with default timeout.
    pub async fn shutdown(&self) -> Result<(), CollectorError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown with custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), CollectorError> {
        let timer_count = self.timers.lock().await.len();
        let mut scheduler = self.scheduler.clone();
        let shutdown_result = tokio::time::timeout(timeout, async {
            scheduler
                .shutdown()
                .await
                .map_err(|e| CollectorError::Scheduler(e.to_string()))
        })
        .await;

        let timed_out = match shutdown_result {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                self.emit(
                    EventSeverity::Error,
                    "Interval scheduler shutdown failed",
                    serde_json::json!({ "timer_count": timer_count, "error": err.to_string() }),
                );
                return Err(err);
            }
            Err(_) => true,
        };

        let (severity, msg) = if timed_out {
            tracing::warn!("Interval scheduler shutdown timed out");
            (EventSeverity::Warn, "Interval scheduler shutdown timed out")
        } else {
            tracing::info!("Interval scheduler shutdown complete");
            (EventSeverity::Info, "Interval scheduler shutdown complete")
        };
        self.timers.lock().await.clear();

        self.emit(
            severity,
            msg,
            serde_json::json!({ "timer_count": timer_count, "timed_out": timed_out }),
        );
        Ok(())
    }

    // --- Private helpers ---

    fn create_timer(&self, interval_secs: u64) -> Result<Job, CollectorError> {
        if interval_secs == 0 || interval_secs > MAX_INTERVAL.as_secs() {
            return Err(CollectorError::Config(format!(
                "interval {interval_secs}s is outside the supported range"
            )));
        }
        let registry = Arc::clone(&self.registry);
        let dispatch = Arc::clone(&self.dispatch);

        Job::new_repeated_async(
            Duration::from_secs(interval_secs),
            move |_: Uuid, _: JobScheduler| {
                let (registry, dispatch) = (Arc::clone(&registry), Arc::clone(&dispatch));
                Box::pin(async move {
                    run_tick(interval_secs, &registry, dispatch.as_ref()).await;
                }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            },
        )
        .map_err(|e| CollectorError::Scheduler(e.to_string()))
    }

    fn emit(&self, severity: EventSeverity, message: impl Into<String>, payload: serde_json::Value) {
        self.events
            .event(Event::system(SCHEDULER_EVENT_SOURCE, severity, message, payload));
    }

    fn emit_info(&self, message: impl Into<String>, payload: serde_json::Value) {
        self.emit(EventSeverity::Info, message, payload);
    }

    fn emit_timer_error(&self, interval_secs: u64, err: &CollectorError, stage: &str) {
        tracing::error!(interval_secs, stage, error = %err, "Timer operation failed");
        self.events.event(
            Event::system(
                SCHEDULER_EVENT_SOURCE,
                EventSeverity::Error,
                format!("Timer for {interval_secs}s {stage} failed"),
                serde_json::json!({
                    "interval_secs": interval_secs,
                    "error": err.to_string(),
                    "stage": stage,
                }),
            )
            .with_kind(EventKind::Error),
        );
    }
}

/// Snapshot one interval group and dispatch one request per device.
async fn run_tick(interval_secs: u64, registry: &JobRegistry, dispatch: &dyn Dispatch) -> usize {
    let Some(group) = registry.group_for(interval_secs).await else {
        tracing::debug!(interval_secs, "Timer fired with no jobs");
        return 0;
    };

    let requests = group.requests();
    let count = requests.len();
    for request in requests {
        dispatch.submit(request);
    }
    tracing::debug!(interval_secs, devices = count, jobs = group.job_count(), "Polling dispatched");
    count
}
