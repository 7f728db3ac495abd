//! Storage builder and handles.
//!
//! Provides a builder pattern for constructing the storage layer
//! and a handles struct for accessing all storage facades.

use std::sync::Arc;

use crate::aggregator::ResultSink;
use crate::model::DiscoveryId;
use crate::storage::db::{DEFAULT_MAX_CONNECTIONS, Persistence, SqlitePool};
use crate::storage::types::{DiscoveryResultRecord, DiscoveryStatus, Event, MetricRow};
use crate::storage::{DiscoveryStore, EventStore, ProvisionStore, StorageError};

/// Builder for constructing the storage layer.
pub struct StorageBuilder {
    url: String,
    max_connections: u32,
}

impl StorageBuilder {
    /// Create a new storage builder for a SQLite URL
    /// (e.g. `sqlite:data/netwatch.db`, `sqlite::memory:`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Set the connection pool size.
    pub fn max_connections(mut self, size: u32) -> Self {
        self.max_connections = size;
        self
    }

    /// Connect, migrate, and return handles.
    pub async fn build(self) -> Result<StorageHandles, StorageError> {
        let pool = SqlitePool::connect(&self.url, self.max_connections).await?;
        let db: Arc<dyn Persistence> = Arc::new(pool.clone());

        tracing::info!(url = %self.url, "Storage initialized");
        Ok(StorageHandles {
            discoveries: DiscoveryStore::new(Arc::clone(&db)),
            provisions: ProvisionStore::new(Arc::clone(&db)),
            events: EventStore::new(Arc::clone(&db)),
            db,
            pool,
        })
    }
}

/// Handles to all storage layer facades.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Clone)]
pub struct StorageHandles {
    /// Credentials, discovery attempts and results.
    pub discoveries: DiscoveryStore,
    /// Provisions, metric jobs and metric values.
    pub provisions: ProvisionStore,
    /// Event log.
    pub events: EventStore,
    /// Generic persistence interface.
    pub db: Arc<dyn Persistence>,
    pool: SqlitePool,
}

impl std::fmt::Debug for StorageHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandles")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl StorageHandles {
    /// Round-trip to the database.
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.db.query("SELECT 1 AS ok", vec![]).await.map(|_| ())
    }

    /// Close the connection pool. Further calls fail.
    pub async fn shutdown(&self) {
        self.pool.close().await;
        tracing::info!("Storage shutdown complete");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

#[async_trait::async_trait]
impl ResultSink for StorageHandles {
    async fn write_discovery_result(
        &self,
        record: DiscoveryResultRecord,
    ) -> Result<(), StorageError> {
        self.discoveries.upsert_result(&record).await
    }

    async fn write_metric_rows(&self, rows: Vec<MetricRow>) -> Result<u64, StorageError> {
        self.provisions.insert_metric_rows(&rows).await
    }

    async fn set_discovery_status(
        &self,
        id: DiscoveryId,
        status: DiscoveryStatus,
    ) -> Result<(), StorageError> {
        self.discoveries.set_status(id, status).await
    }

    async fn write_event(&self, event: Event) -> Result<(), StorageError> {
        self.events.insert(&event).await
    }
}
