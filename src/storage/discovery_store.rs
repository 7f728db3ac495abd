//! Credential profiles, discovery attempts and discovery results.

use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use crate::model::{Credential, CredentialId, DiscoveryId, SystemType, validate_port};
use crate::storage::StorageError;
use crate::storage::db::{Persistence, Row, RowExt};
use crate::storage::types::{
    DiscoveryOutcome, DiscoveryRecord, DiscoveryResultRecord, DiscoveryStatus,
};

/// Success replaces failure; failure never replaces success.
const UPSERT_RESULT_SQL: &str = "INSERT INTO discovery_results
        (discovery_id, ip, port, credential_profile_id, result, msg, data, updated_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT (discovery_id, ip) DO UPDATE SET
        port = excluded.port,
        credential_profile_id = excluded.credential_profile_id,
        result = excluded.result,
        msg = excluded.msg,
        data = excluded.data,
        updated_at = excluded.updated_at
     WHERE discovery_results.result <> 'completed' OR excluded.result = 'completed'";

/// Discovery storage facade.
#[derive(Clone)]
pub struct DiscoveryStore {
    db: Arc<dyn Persistence>,
}

impl std::fmt::Debug for DiscoveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryStore").finish_non_exhaustive()
    }
}

impl DiscoveryStore {
    pub fn new(db: Arc<dyn Persistence>) -> Self {
        Self { db }
    }

    // =========================================================================
    // Credentials
    // =========================================================================

    /// Create a credential profile.
    pub async fn create_credential(
        &self,
        name: &str,
        username: &str,
        secret: &str,
        system_type: SystemType,
    ) -> Result<CredentialId, StorageError> {
        let rows = self
            .db
            .query(
                "INSERT INTO credential_profiles (name, username, secret, system_type, created_at)
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
                vec![
                    json!(name),
                    json!(username),
                    json!(secret),
                    json!(system_type.as_ref()),
                    json!(Utc::now().timestamp_millis()),
                ],
            )
            .await?;
        returned_id(&rows)
    }

    /// Load credential snapshots by id. Unknown ids are skipped.
    pub async fn credentials(&self, ids: &[CredentialId]) -> Result<Vec<Credential>, StorageError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let rows = self
                .db
                .query(
                    "SELECT id, username, secret, system_type FROM credential_profiles WHERE id = ?",
                    vec![json!(id)],
                )
                .await?;
            if let Some(row) = rows.first() {
                out.push(credential_from_row(row)?);
            }
        }
        Ok(out)
    }

    // =========================================================================
    // Discoveries
    // =========================================================================

    /// Create a pending discovery attempt.
    pub async fn create_discovery(
        &self,
        name: &str,
        address: &str,
        port: u16,
        credential_ids: &[CredentialId],
    ) -> Result<DiscoveryId, StorageError> {
        let now = Utc::now().timestamp_millis();
        let rows = self
            .db
            .query(
                "INSERT INTO discoveries (name, address, port, status, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
                vec![
                    json!(name),
                    json!(address),
                    json!(port),
                    json!(DiscoveryStatus::Pending.as_ref()),
                    json!(now),
                    json!(now),
                ],
            )
            .await?;
        let id = returned_id(&rows)?;

        if !credential_ids.is_empty() {
            self.db
                .batch(
                    "INSERT OR IGNORE INTO discovery_credentials (discovery_id, credential_profile_id)
                     VALUES (?, ?)",
                    credential_ids.iter().map(|c| vec![json!(id), json!(c)]).collect(),
                )
                .await?;
        }
        Ok(id)
    }

    /// Load a discovery attempt with its candidate credential ids.
    pub async fn get(&self, id: DiscoveryId) -> Result<Option<DiscoveryRecord>, StorageError> {
        let rows = self
            .db
            .query(
                "SELECT id, name, address, port, status FROM discoveries WHERE id = ?",
                vec![json!(id)],
            )
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let creds = self
            .db
            .query(
                "SELECT credential_profile_id FROM discovery_credentials
                 WHERE discovery_id = ? ORDER BY credential_profile_id",
                vec![json!(id)],
            )
            .await?;
        let credential_ids = creds
            .iter()
            .map(|r| r.i64("credential_profile_id"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(DiscoveryRecord {
            id: row.i64("id")?,
            name: row.str("name")?.to_string(),
            address: row.str("address")?.to_string(),
            port: port_column(row, "port")?,
            status: parse_enum(row.str("status")?)?,
            credential_ids,
        }))
    }

    /// Persist a status transition.
    pub async fn set_status(
        &self,
        id: DiscoveryId,
        status: DiscoveryStatus,
    ) -> Result<(), StorageError> {
        let rows = self
            .db
            .query(
                "UPDATE discoveries SET status = ?, updated_at = ? WHERE id = ? RETURNING id",
                vec![
                    json!(status.as_ref()),
                    json!(Utc::now().timestamp_millis()),
                    json!(id),
                ],
            )
            .await?;
        if rows.is_empty() {
            return Err(StorageError::NotFound {
                entity: "discovery",
                id,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Results
    // =========================================================================

    /// Drop the results of a previous run.
    pub async fn clear_results(&self, id: DiscoveryId) -> Result<u64, StorageError> {
        self.db
            .batch(
                "DELETE FROM discovery_results WHERE discovery_id = ?",
                vec![vec![json!(id)]],
            )
            .await
    }

    /// Insert or merge one per-host result.
    pub async fn upsert_result(&self, record: &DiscoveryResultRecord) -> Result<(), StorageError> {
        self.db
            .batch(UPSERT_RESULT_SQL, vec![result_params(record)?])
            .await?;
        Ok(())
    }

    /// Insert or merge many per-host results in one transaction.
    pub async fn upsert_results(
        &self,
        records: &[DiscoveryResultRecord],
    ) -> Result<u64, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let params = records
            .iter()
            .map(result_params)
            .collect::<Result<Vec<_>, _>>()?;
        self.db.batch(UPSERT_RESULT_SQL, params).await
    }

    /// All results of a discovery attempt, ordered by address.
    pub async fn results(
        &self,
        id: DiscoveryId,
    ) -> Result<Vec<DiscoveryResultRecord>, StorageError> {
        let rows = self
            .db
            .query(
                "SELECT discovery_id, ip, port, credential_profile_id, result, msg, data
                 FROM discovery_results WHERE discovery_id = ? ORDER BY id",
                vec![json!(id)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(DiscoveryResultRecord {
                    discovery_id: row.i64("discovery_id")?,
                    address: row.str("ip")?.to_string(),
                    port: port_column(row, "port")?,
                    credential_profile_id: row.opt_i64("credential_profile_id")?,
                    result: parse_enum::<DiscoveryOutcome>(row.str("result")?)?,
                    msg: row.opt_str("msg")?.map(str::to_string),
                    data: row.json("data")?,
                })
            })
            .collect()
    }
}

fn result_params(record: &DiscoveryResultRecord) -> Result<Vec<Value>, StorageError> {
    let data = match &record.data {
        Some(v) => Value::String(serde_json::to_string(v)?),
        None => Value::Null,
    };
    Ok(vec![
        json!(record.discovery_id),
        json!(record.address),
        json!(record.port),
        json!(record.credential_profile_id),
        json!(record.result.as_ref()),
        json!(record.msg),
        data,
        json!(Utc::now().timestamp_millis()),
    ])
}

pub(crate) fn credential_from_row(row: &Row) -> Result<Credential, StorageError> {
    Ok(Credential::new(
        row.i64("id")?,
        row.str("username")?,
        row.str("secret")?,
        parse_enum(row.str("system_type")?)?,
    ))
}

pub(crate) fn returned_id(rows: &[Row]) -> Result<i64, StorageError> {
    rows.first()
        .ok_or_else(|| StorageError::InvalidData("statement returned no id".to_string()))?
        .i64("id")
}

pub(crate) fn port_column(row: &Row, col: &str) -> Result<u16, StorageError> {
    validate_port(row.i64(col)?).map_err(|e| StorageError::InvalidData(e.to_string()))
}

pub(crate) fn parse_enum<T: FromStr>(s: &str) -> Result<T, StorageError> {
    T::from_str(s).map_err(|_| StorageError::InvalidData(format!("unknown value '{s}'")))
}
