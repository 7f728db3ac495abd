//! Provisions, metric jobs and polled metric values.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use crate::collector::JobSource;
use crate::model::{Credential, CredentialId, DeviceTarget, DiscoveryId, JobId, MetricJob, ProvisionId};
use crate::storage::StorageError;
use crate::storage::db::{Persistence, Row, RowExt};
use crate::storage::discovery_store::{parse_enum, port_column, returned_id};
use crate::storage::types::{MetricRow, ProvisionRecord};

/// Metric jobs joined with their provision and credential.
const JOB_SELECT_SQL: &str = "SELECT j.id, j.provision_id, j.metric, j.interval_secs, j.enabled,
            p.ip, p.port,
            c.id AS credential_id, c.username, c.secret, c.system_type
     FROM metric_jobs j
     JOIN provisions p ON p.id = j.provision_id
     JOIN credential_profiles c ON c.id = p.credential_profile_id";

/// Provision and polling storage facade.
#[derive(Clone)]
pub struct ProvisionStore {
    db: Arc<dyn Persistence>,
}

impl std::fmt::Debug for ProvisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionStore").finish_non_exhaustive()
    }
}

impl ProvisionStore {
    pub fn new(db: Arc<dyn Persistence>) -> Self {
        Self { db }
    }

    // =========================================================================
    // Provisions
    // =========================================================================

    /// Promote a device into polling.
    pub async fn create_provision(
        &self,
        target: &DeviceTarget,
        credential_id: CredentialId,
        discovery_id: Option<DiscoveryId>,
    ) -> Result<ProvisionId, StorageError> {
        let rows = self
            .db
            .query(
                "INSERT INTO provisions (ip, port, credential_profile_id, discovery_id, created_at)
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
                vec![
                    json!(target.address),
                    json!(target.port),
                    json!(credential_id),
                    json!(discovery_id),
                    json!(Utc::now().timestamp_millis()),
                ],
            )
            .await?;
        returned_id(&rows)
    }

    pub async fn provision(&self, id: ProvisionId) -> Result<Option<ProvisionRecord>, StorageError> {
        let rows = self
            .db
            .query(
                "SELECT id, ip, port, credential_profile_id, discovery_id FROM provisions WHERE id = ?",
                vec![json!(id)],
            )
            .await?;
        rows.first()
            .map(|row| {
                Ok(ProvisionRecord {
                    id: row.i64("id")?,
                    address: row.str("ip")?.to_string(),
                    port: port_column(row, "port")?,
                    credential_id: row.i64("credential_profile_id")?,
                    discovery_id: row.opt_i64("discovery_id")?,
                })
            })
            .transpose()
    }

    /// Delete a provision together with its metric jobs.
    ///
    /// Returns whether a provision was removed.
    pub async fn delete_provision(&self, id: ProvisionId) -> Result<bool, StorageError> {
        let jobs = self
            .db
            .batch(
                "DELETE FROM metric_jobs WHERE provision_id = ?",
                vec![vec![json!(id)]],
            )
            .await?;
        let removed = self
            .db
            .batch("DELETE FROM provisions WHERE id = ?", vec![vec![json!(id)]])
            .await?;
        tracing::debug!(provision_id = id, jobs, "Provision deleted");
        Ok(removed > 0)
    }

    // =========================================================================
    // Metric jobs
    // =========================================================================

    /// Create or update the job collecting `metric` from a provision.
    pub async fn upsert_metric_job(
        &self,
        provision_id: ProvisionId,
        metric: &str,
        interval_secs: u64,
        enabled: bool,
    ) -> Result<JobId, StorageError> {
        let rows = self
            .db
            .query(
                "INSERT INTO metric_jobs (provision_id, metric, interval_secs, enabled)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (provision_id, metric) DO UPDATE SET
                    interval_secs = excluded.interval_secs,
                    enabled = excluded.enabled
                 RETURNING id",
                vec![
                    json!(provision_id),
                    json!(metric),
                    json!(interval_secs),
                    json!(i64::from(enabled)),
                ],
            )
            .await?;
        returned_id(&rows)
    }

    /// Load one job, enabled or not.
    pub async fn job(&self, id: JobId) -> Result<Option<MetricJob>, StorageError> {
        let rows = self
            .db
            .query(&format!("{JOB_SELECT_SQL} WHERE j.id = ?"), vec![json!(id)])
            .await?;
        rows.first().map(job_from_row).transpose()
    }

    /// Enabled jobs of one provision.
    pub async fn jobs_for_provision(
        &self,
        provision_id: ProvisionId,
    ) -> Result<Vec<MetricJob>, StorageError> {
        let rows = self
            .db
            .query(
                &format!("{JOB_SELECT_SQL} WHERE j.provision_id = ? AND j.enabled = 1 ORDER BY j.id"),
                vec![json!(provision_id)],
            )
            .await?;
        Ok(decode_jobs(&rows))
    }

    /// Every enabled job across all provisions.
    pub async fn enabled_jobs(&self) -> Result<Vec<MetricJob>, StorageError> {
        let rows = self
            .db
            .query(
                &format!("{JOB_SELECT_SQL} WHERE j.enabled = 1 ORDER BY j.id"),
                vec![],
            )
            .await?;
        Ok(decode_jobs(&rows))
    }

    // =========================================================================
    // Metric values
    // =========================================================================

    /// Bulk insert polled metric rows in one transaction.
    pub async fn insert_metric_rows(&self, rows: &[MetricRow]) -> Result<u64, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let params = rows
            .iter()
            .map(|r| {
                Ok(vec![
                    json!(r.ts.timestamp_millis()),
                    json!(r.provision_id),
                    json!(r.address),
                    Value::String(serde_json::to_string(&r.metrics)?),
                    Value::String(serde_json::to_string(&r.data)?),
                ])
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        self.db
            .batch(
                "INSERT INTO metric_values (ts, provision_id, ip, metrics, data) VALUES (?, ?, ?, ?, ?)",
                params,
            )
            .await
    }

    /// Most recent metric rows of a provision, newest first.
    pub async fn metric_rows(
        &self,
        provision_id: ProvisionId,
        limit: u32,
    ) -> Result<Vec<MetricRow>, StorageError> {
        let rows = self
            .db
            .query(
                "SELECT ts, provision_id, ip, metrics, data FROM metric_values
                 WHERE provision_id = ? ORDER BY ts DESC, id DESC LIMIT ?",
                vec![json!(provision_id), json!(limit)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let ts = row.i64("ts")?;
                Ok(MetricRow {
                    ts: Utc
                        .timestamp_millis_opt(ts)
                        .single()
                        .ok_or_else(|| StorageError::InvalidData(format!("bad timestamp {ts}")))?,
                    provision_id: row.i64("provision_id")?,
                    address: row.str("ip")?.to_string(),
                    metrics: serde_json::from_str(row.str("metrics")?)?,
                    data: row.json("data")?.unwrap_or(Value::Null),
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl JobSource for ProvisionStore {
    async fn load_enabled_jobs(&self) -> Result<Vec<MetricJob>, StorageError> {
        self.enabled_jobs().await
    }
}

/// Decode job rows, skipping rows that carry an invalid target.
fn decode_jobs(rows: &[Row]) -> Vec<MetricJob> {
    rows.iter()
        .filter_map(|row| match job_from_row(row) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::warn!(job = ?row.get("id"), error = %e, "Skipping invalid metric job");
                None
            }
        })
        .collect()
}

fn job_from_row(row: &Row) -> Result<MetricJob, StorageError> {
    let target = DeviceTarget::new(row.str("ip")?, port_column(row, "port")?)
        .map_err(|e| StorageError::InvalidData(e.to_string()))?;
    let interval = row.i64("interval_secs")?;
    let credential = Credential::new(
        row.i64("credential_id")?,
        row.str("username")?,
        row.str("secret")?,
        parse_enum(row.str("system_type")?)?,
    );
    Ok(MetricJob {
        id: row.i64("id")?,
        parent_id: row.i64("provision_id")?,
        metric: row.str("metric")?.to_string(),
        target,
        credential,
        interval_secs: u64::try_from(interval)
            .map_err(|_| StorageError::InvalidData(format!("negative interval {interval}")))?,
        enabled: row.i64("enabled")? != 0,
    })
}
