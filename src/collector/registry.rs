//! Active job registry.
//!
//! The in-memory set of enabled metric jobs, keyed by job id. A single
//! `RwLock` guards the map, so every mutation is atomic with respect to
//! snapshots: a scheduler tick sees the registry either before or after an
//! insert/remove, never in between.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use crate::collector::{CollectorError, JobSource, clamp_interval};
use crate::model::{Credential, DeviceTarget, JobId, MetricJob, ProvisionId};
use crate::plugin::{PluginRequest, PluginTarget};

/// Jobs of one device within an interval group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceJobs {
    pub target: DeviceTarget,
    #[serde(skip)]
    pub credential: Credential,
    /// Metric names, in job id order.
    pub metrics: Vec<String>,
}

/// All jobs sharing one polling interval, grouped by parent provision.
///
/// Derived from the registry on demand; never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalGroup {
    pub interval_secs: u64,
    pub devices: BTreeMap<ProvisionId, DeviceJobs>,
}

impl IntervalGroup {
    /// One polling request per device, coalescing all of its metrics.
    pub fn requests(&self) -> Vec<PluginRequest> {
        self.devices
            .iter()
            .map(|(provision_id, jobs)| {
                PluginRequest::polling(vec![PluginTarget::polling(
                    *provision_id,
                    &jobs.target,
                    &jobs.credential,
                    jobs.metrics.clone(),
                )])
            })
            .collect()
    }

    /// Number of metric jobs in the group.
    pub fn job_count(&self) -> usize {
        self.devices.values().map(|d| d.metrics.len()).sum()
    }
}

/// Authoritative set of currently active polling jobs.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, MetricJob>>,
    source: Arc<dyn JobSource>,
    interval_changed: Arc<Notify>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field(
                "job_count",
                &self.jobs.try_read().map(|j| j.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl JobRegistry {
    pub fn new(source: Arc<dyn JobSource>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            source,
            interval_changed: Arc::new(Notify::new()),
        }
    }

    /// Notified whenever a mutation changes the set of distinct intervals.
    pub fn interval_changes(&self) -> Arc<Notify> {
        Arc::clone(&self.interval_changed)
    }

    /// Replace the whole set with the enabled jobs from persistence.
    ///
    /// On a load failure the current set is left untouched.
    pub async fn refresh(&self) -> Result<usize, CollectorError> {
        let loaded = self.source.load_enabled_jobs().await?;
        let fresh: HashMap<JobId, MetricJob> = loaded
            .into_iter()
            .filter(|j| j.enabled)
            .map(|j| (j.id, normalize(j)))
            .collect();
        let count = fresh.len();

        self.mutate(|jobs| *jobs = fresh).await;
        tracing::debug!(jobs = count, "Job registry refreshed");
        Ok(count)
    }

    /// Add or replace a job. Disabled jobs are not admitted.
    ///
    /// Returns whether the job is now present.
    pub async fn insert(&self, job: MetricJob) -> bool {
        if !job.enabled {
            tracing::debug!(job_id = job.id, "Ignoring insert of disabled job");
            return false;
        }
        let job = normalize(job);
        self.mutate(|jobs| {
            jobs.insert(job.id, job);
        })
        .await;
        true
    }

    /// Apply a changed job: re-insert when enabled, remove when disabled.
    pub async fn update(&self, job: MetricJob) {
        if job.enabled {
            self.insert(job).await;
        } else {
            self.remove(job.id).await;
        }
    }

    /// Remove one job.
    pub async fn remove(&self, id: JobId) -> Option<MetricJob> {
        let mut removed = None;
        self.mutate(|jobs| removed = jobs.remove(&id)).await;
        removed
    }

    /// Remove every job of a provision. Returns the number removed.
    pub async fn remove_by_parent(&self, parent_id: ProvisionId) -> usize {
        let mut removed = 0;
        self.mutate(|jobs| {
            let before = jobs.len();
            jobs.retain(|_, j| j.parent_id != parent_id);
            removed = before - jobs.len();
        })
        .await;
        if removed > 0 {
            tracing::debug!(provision_id = parent_id, removed, "Removed jobs of provision");
        }
        removed
    }

    /// All jobs, ordered by id.
    pub async fn snapshot(&self) -> Vec<MetricJob> {
        let mut jobs: Vec<_> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub async fn get(&self, id: JobId) -> Option<MetricJob> {
        self.jobs.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Distinct intervals present, ascending.
    pub async fn intervals(&self) -> Vec<u64> {
        intervals_of(&*self.jobs.read().await).into_iter().collect()
    }

    /// Every interval group, ascending by interval.
    pub async fn groups(&self) -> Vec<IntervalGroup> {
        let jobs = self.snapshot().await;
        let mut groups: BTreeMap<u64, IntervalGroup> = BTreeMap::new();
        for job in jobs {
            let group = groups
                .entry(job.interval_secs)
                .or_insert_with(|| IntervalGroup {
                    interval_secs: job.interval_secs,
                    devices: BTreeMap::new(),
                });
            add_to_group(group, job);
        }
        groups.into_values().collect()
    }

    /// The group for one interval, or `None` if no job uses it.
    pub async fn group_for(&self, interval_secs: u64) -> Option<IntervalGroup> {
        let jobs = self.snapshot().await;
        let mut group = IntervalGroup {
            interval_secs,
            devices: BTreeMap::new(),
        };
        for job in jobs.into_iter().filter(|j| j.interval_secs == interval_secs) {
            add_to_group(&mut group, job);
        }
        (!group.devices.is_empty()).then_some(group)
    }

    /// Run `f` under the write lock and wake the scheduler if the interval
    /// set changed.
    async fn mutate(&self, f: impl FnOnce(&mut HashMap<JobId, MetricJob>)) {
        let changed = {
            let mut jobs = self.jobs.write().await;
            let before = intervals_of(&*jobs);
            f(&mut jobs);
            before != intervals_of(&*jobs)
        };
        if changed {
            tracing::debug!("Interval set changed");
            self.interval_changed.notify_one();
        }
    }
}

fn normalize(mut job: MetricJob) -> MetricJob {
    job.interval_secs = clamp_interval(job.interval_secs);
    job
}

fn intervals_of(jobs: &HashMap<JobId, MetricJob>) -> BTreeSet<u64> {
    jobs.values().map(|j| j.interval_secs).collect()
}

fn add_to_group(group: &mut IntervalGroup, job: MetricJob) {
    group
        .devices
        .entry(job.parent_id)
        .or_insert_with(|| DeviceJobs {
            target: job.target.clone(),
            credential: job.credential.clone(),
            metrics: Vec::new(),
        })
        .metrics
        .push(job.metric);
}
