//! SQLite backend implementation using sqlx.
//!
//! Provides connection pooling, schema migration and the [`Persistence`]
//! implementation for SQLite.

use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool as SqlxPool,
    SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Column, Row as _, Sqlite, TypeInfo, ValueRef};

use crate::storage::StorageError;
use crate::storage::db::{Persistence, Row};

/// Default maximum connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite connection pool wrapper.
///
/// Wraps sqlx's SqlitePool with WAL mode, schema migrations and the
/// [`Persistence`] interface.
#[derive(Clone)]
pub struct SqlitePool {
    inner: SqlxPool,
}

impl std::fmt::Debug for SqlitePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePool")
            .field("size", &self.inner.size())
            .finish_non_exhaustive()
    }
}

impl SqlitePool {
    /// Connect to a SQLite database and apply pending migrations.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL, e.g., `sqlite:data/netwatch.db`
    /// * `max_connections` - pool size; forced to 1 for in-memory databases,
    ///   where every connection would otherwise see its own empty database
    ///
    /// # Configuration
    ///
    /// - WAL journal mode for better concurrency
    /// - Normal synchronous mode for performance with durability
    /// - Create database if not exists
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(DEFAULT_CONNECT_TIMEOUT);
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(url = %url, in_memory, "SQLite pool ready");

        Ok(Self { inner: pool })
    }

    /// Get the underlying sqlx pool for direct query execution.
    #[inline]
    pub fn inner(&self) -> &SqlxPool {
        &self.inner
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Check if the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePool {
    async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, StorageError> {
        let query = params.into_iter().fold(sqlx::query(sql), bind_value);
        let rows = query.fetch_all(&self.inner).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn batch(&self, sql: &str, params: Vec<Vec<Value>>) -> Result<u64, StorageError> {
        let mut tx = self.inner.begin().await?;
        let mut affected = 0;
        for tuple in params {
            let query = tuple.into_iter().fold(sqlx::query(sql), bind_value);
            affected += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}

fn bind_value(query: Query<'_>, value: Value) -> Query<'_> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s),
        other => query.bind(other.to_string()),
    }
}

fn decode_row(row: &SqliteRow) -> Result<Row, StorageError> {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(idx)?),
                "REAL" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(idx)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(
                    String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(idx)?)
                        .into_owned(),
                ),
                _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
