//! Event log storage.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use crate::storage::StorageError;
use crate::storage::db::{Persistence, RowExt};
use crate::storage::discovery_store::parse_enum;
use crate::storage::types::Event;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;

/// Event storage facade.
#[derive(Clone)]
pub struct EventStore {
    db: Arc<dyn Persistence>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore").finish_non_exhaustive()
    }
}

impl EventStore {
    pub fn new(db: Arc<dyn Persistence>) -> Self {
        Self { db }
    }

    /// Insert a single event (low volume, immediate write).
    pub async fn insert(&self, e: &Event) -> Result<(), StorageError> {
        let payload = match &e.payload {
            Some(p) => Value::String(serde_json::to_string(p)?),
            None => Value::Null,
        };
        self.db
            .batch(
                "INSERT INTO events (ts, source, kind, severity, message, payload)
                 VALUES (?, ?, ?, ?, ?, ?)",
                vec![vec![
                    json!(e.ts.timestamp_millis()),
                    json!(e.source),
                    json!(e.kind.as_ref()),
                    json!(e.severity.as_ref()),
                    json!(e.message),
                    payload,
                ]],
            )
            .await?;
        Ok(())
    }

    /// Most recent events, newest first, optionally filtered by source.
    pub async fn recent(
        &self,
        source: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Event>, StorageError> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
        let (sql, params) = match source {
            Some(src) => (
                "SELECT id, ts, source, kind, severity, message, payload FROM events
                 WHERE source = ? ORDER BY ts DESC, id DESC LIMIT ?",
                vec![json!(src), json!(limit)],
            ),
            None => (
                "SELECT id, ts, source, kind, severity, message, payload FROM events
                 ORDER BY ts DESC, id DESC LIMIT ?",
                vec![json!(limit)],
            ),
        };

        let rows = self.db.query(sql, params).await?;
        rows.iter()
            .map(|row| {
                let ts = row.i64("ts")?;
                Ok(Event {
                    id: Some(row.i64("id")?),
                    ts: Utc
                        .timestamp_millis_opt(ts)
                        .single()
                        .ok_or_else(|| StorageError::InvalidData(format!("bad timestamp {ts}")))?,
                    source: row.str("source")?.to_string(),
                    kind: parse_enum(row.str("kind")?)?,
                    severity: parse_enum(row.str("severity")?)?,
                    message: row.str("message")?.to_string(),
                    payload: row.json("payload")?,
                })
            })
            .collect()
    }
}
