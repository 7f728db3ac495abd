//! Engine
//!
//! Wires the orchestration components together and owns their background
//! tasks:
//!
//! ```text
//! run_discovery ──► DiscoveryRunner ──► Prober ──┐
//!                                                ├──► PluginInvoker ──► ResultAggregator ──► storage
//! JobRegistry ──► IntervalScheduler (timers) ────┘
//! ```
//!
//! External callers talk to the engine only through [`EngineHandle`]: each
//! trigger kind has its own bounded channel and is fire-and-forget.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::aggregator::{AggregatorConfig, AggregatorHandle, ResultAggregator};
use crate::collector::{CollectorError, IntervalScheduler, JobRegistry, SchedulerConfig};
use crate::discovery::{
    DiscoveryConfig, DiscoveryRunner, NetworkProbe, ProbeBackend, ProbeConfig, Prober,
};
use crate::model::{DiscoveryId, JobId, ProvisionId};
use crate::plugin::{Dispatch, PluginConfig, PluginInvoker};
use crate::storage::{ProvisionStore, StorageError, StorageHandles};

/// Capacity of each trigger channel.
const TRIGGER_CHANNEL_CAPACITY: usize = 1024;

/// Time allowed for the aggregator to drain on shutdown.
const AGGREGATOR_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine settings, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The trigger channel is at capacity.
    #[error("{0} trigger channel is full")]
    TriggerFull(&'static str),

    /// The engine is shut down.
    #[error("{0} trigger channel is closed")]
    TriggerClosed(&'static str),
}

fn trigger_error<T>(channel: &'static str, err: TrySendError<T>) -> EngineError {
    match err {
        TrySendError::Full(_) => EngineError::TriggerFull(channel),
        TrySendError::Closed(_) => EngineError::TriggerClosed(channel),
    }
}

#[derive(Debug, Clone, Copy)]
enum ProvisionTrigger {
    Created(ProvisionId),
    Deleted(ProvisionId),
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable trigger side of the engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    discovery_tx: mpsc::Sender<DiscoveryId>,
    provision_tx: mpsc::Sender<ProvisionTrigger>,
    job_tx: mpsc::Sender<JobId>,
}

impl EngineHandle {
    /// Queue a discovery run.
    pub fn run_discovery(&self, id: DiscoveryId) -> Result<(), EngineError> {
        self.discovery_tx
            .try_send(id)
            .map_err(|e| trigger_error("discovery", e))
    }

    /// A provision was created; its enabled jobs join the registry.
    pub fn provision_created(&self, id: ProvisionId) -> Result<(), EngineError> {
        self.provision_tx
            .try_send(ProvisionTrigger::Created(id))
            .map_err(|e| trigger_error("provision", e))
    }

    /// A provision was deleted; its jobs leave the registry.
    pub fn provision_deleted(&self, id: ProvisionId) -> Result<(), EngineError> {
        self.provision_tx
            .try_send(ProvisionTrigger::Deleted(id))
            .map_err(|e| trigger_error("provision", e))
    }

    /// A metric job changed in persistence; the registry reloads it.
    pub fn metric_job_updated(&self, id: JobId) -> Result<(), EngineError> {
        self.job_tx
            .try_send(id)
            .map_err(|e| trigger_error("metric job", e))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Running engine. Dropping it without [`shutdown`](Self::shutdown) leaves
/// the background tasks to the runtime.
pub struct Engine {
    registry: Arc<JobRegistry>,
    scheduler: Arc<IntervalScheduler>,
    aggregator: AggregatorHandle,
    aggregator_task: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Start with the ICMP/TCP network probe.
    pub async fn start(
        config: EngineConfig,
        storage: StorageHandles,
    ) -> Result<(EngineHandle, Engine), EngineError> {
        let probe = Arc::new(NetworkProbe::new(config.probe.clone()));
        Self::start_with_probe(config, storage, probe).await
    }

    /// Start with a custom probe backend.
    pub async fn start_with_probe(
        config: EngineConfig,
        storage: StorageHandles,
        probe: Arc<dyn ProbeBackend>,
    ) -> Result<(EngineHandle, Engine), EngineError> {
        let (aggregator, aggregator_task) =
            ResultAggregator::spawn(&config.aggregator, Arc::new(storage.clone()));
        let dispatch: Arc<dyn Dispatch> =
            Arc::new(PluginInvoker::new(config.plugin.clone(), aggregator.clone()));

        let registry = Arc::new(JobRegistry::new(Arc::new(storage.provisions.clone())));
        let loaded = registry.refresh().await?;

        let scheduler = Arc::new(
            IntervalScheduler::new(
                Arc::clone(&registry),
                Arc::clone(&dispatch),
                aggregator.clone(),
            )
            .await?,
        );
        scheduler.start().await?;
        if let Err(e) = scheduler.refresh().await {
            tracing::error!(error = %e, "Initial timer refresh failed");
        }

        let runner = DiscoveryRunner::new(
            storage.discoveries.clone(),
            Prober::new(probe, config.probe.concurrency),
            dispatch,
            aggregator.clone(),
            config.discovery.clone(),
        );

        let (discovery_tx, discovery_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let (provision_tx, provision_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
        let (job_tx, job_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);

        let tasks = vec![
            scheduler.spawn_refresh_loop(config.scheduler.refresh_interval),
            tokio::spawn(discovery_listener(runner, discovery_rx)),
            tokio::spawn(provision_listener(
                storage.provisions.clone(),
                Arc::clone(&registry),
                provision_rx,
            )),
            tokio::spawn(job_listener(
                storage.provisions.clone(),
                Arc::clone(&registry),
                job_rx,
            )),
        ];

        tracing::info!(
            jobs = loaded,
            plugin = %config.plugin.path.display(),
            workers = config.plugin.workers,
            "Engine started"
        );

        let handle = EngineHandle {
            discovery_tx,
            provision_tx,
            job_tx,
        };
        let engine = Engine {
            registry,
            scheduler,
            aggregator,
            aggregator_task,
            tasks,
        };
        Ok((handle, engine))
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<IntervalScheduler> {
        &self.scheduler
    }

    pub fn aggregator(&self) -> &AggregatorHandle {
        &self.aggregator
    }

    /// Stop listeners and timers, then drain the aggregator.
    ///
    /// Plugin invocations already running finish on their own; results they
    /// produce after the aggregator stopped are dropped.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        for task in &self.tasks {
            task.abort();
        }
        let scheduler_result = self.scheduler.shutdown().await;

        self.aggregator.shutdown().await;
        if tokio::time::timeout(AGGREGATOR_DRAIN_TIMEOUT, self.aggregator_task)
            .await
            .is_err()
        {
            tracing::warn!("Aggregator did not stop in time");
        }

        tracing::info!("Engine shutdown complete");
        scheduler_result.map_err(EngineError::from)
    }
}

// =============================================================================
// Trigger listeners
// =============================================================================

async fn discovery_listener(runner: DiscoveryRunner, mut rx: mpsc::Receiver<DiscoveryId>) {
    while let Some(id) = rx.recv().await {
        let runner = runner.clone();
        tokio::spawn(async move {
            // Failures are logged and recorded by the runner itself.
            let _ = runner.run(id).await;
        });
    }
    tracing::debug!("Discovery trigger channel closed");
}

async fn provision_listener(
    store: ProvisionStore,
    registry: Arc<JobRegistry>,
    mut rx: mpsc::Receiver<ProvisionTrigger>,
) {
    while let Some(trigger) = rx.recv().await {
        match trigger {
            ProvisionTrigger::Created(id) => match store.jobs_for_provision(id).await {
                Ok(jobs) => {
                    let mut added = 0;
                    for job in jobs {
                        if registry.insert(job).await {
                            added += 1;
                        }
                    }
                    tracing::info!(provision_id = id, jobs = added, "Provision activated");
                }
                Err(e) => {
                    tracing::error!(provision_id = id, error = %e, "Failed to load provision jobs");
                }
            },
            ProvisionTrigger::Deleted(id) => {
                let removed = registry.remove_by_parent(id).await;
                tracing::info!(provision_id = id, jobs = removed, "Provision deactivated");
            }
        }
    }
    tracing::debug!("Provision trigger channel closed");
}

async fn job_listener(store: ProvisionStore, registry: Arc<JobRegistry>, mut rx: mpsc::Receiver<JobId>) {
    while let Some(id) = rx.recv().await {
        match store.job(id).await {
            Ok(Some(job)) => {
                tracing::debug!(job_id = id, enabled = job.enabled, interval_secs = job.interval_secs, "Metric job updated");
                registry.update(job).await;
            }
            Ok(None) => {
                registry.remove(id).await;
                tracing::debug!(job_id = id, "Metric job gone, removed");
            }
            Err(e) => tracing::error!(job_id = id, error = %e, "Failed to load metric job"),
        }
    }
    tracing::debug!("Metric job trigger channel closed");
}
