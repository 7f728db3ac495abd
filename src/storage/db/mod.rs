//! Database abstraction layer.
//!
//! Everything above this module talks to the database through the
//! [`Persistence`] trait: SQL text plus JSON parameters in, JSON rows out.
//! Currently backed by SQLite.
//!
//! # Example
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:data/netwatch.db?mode=rwc", 5).await?;
//! let rows = pool.query("SELECT id, name FROM discoveries WHERE id = ?", vec![json!(1)]).await?;
//! ```

mod sqlite;

use serde_json::Value;

use crate::storage::StorageError;

pub use sqlite::{DEFAULT_MAX_CONNECTIONS, SqlitePool};

/// A result row keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Generic request/response persistence interface.
///
/// Parameters are positional (`?`). `null`, booleans, integers, reals and
/// strings bind natively; arrays and objects bind as JSON text.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Run one statement and return all produced rows.
    async fn query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>, StorageError>;

    /// Run one statement per parameter tuple inside a single transaction.
    ///
    /// Returns the total number of rows affected.
    async fn batch(&self, sql: &str, params: Vec<Vec<Value>>) -> Result<u64, StorageError>;
}

/// Typed column access on [`Row`].
pub(crate) trait RowExt {
    fn i64(&self, col: &str) -> Result<i64, StorageError>;
    fn opt_i64(&self, col: &str) -> Result<Option<i64>, StorageError>;
    fn str(&self, col: &str) -> Result<&str, StorageError>;
    fn opt_str(&self, col: &str) -> Result<Option<&str>, StorageError>;
    /// Column holding JSON text, decoded.
    fn json(&self, col: &str) -> Result<Option<Value>, StorageError>;
}

impl RowExt for Row {
    fn i64(&self, col: &str) -> Result<i64, StorageError> {
        self.opt_i64(col)?
            .ok_or_else(|| StorageError::InvalidData(format!("column '{col}' is null")))
    }

    fn opt_i64(&self, col: &str) -> Result<Option<i64>, StorageError> {
        match self.get(col) {
            None => Err(missing(col)),
            Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| StorageError::InvalidData(format!("column '{col}' is not an integer"))),
        }
    }

    fn str(&self, col: &str) -> Result<&str, StorageError> {
        self.opt_str(col)?
            .ok_or_else(|| StorageError::InvalidData(format!("column '{col}' is null")))
    }

    fn opt_str(&self, col: &str) -> Result<Option<&str>, StorageError> {
        match self.get(col) {
            None => Err(missing(col)),
            Some(Value::Null) => Ok(None),
            Some(v) => v
                .as_str()
                .map(Some)
                .ok_or_else(|| StorageError::InvalidData(format!("column '{col}' is not text"))),
        }
    }

    fn json(&self, col: &str) -> Result<Option<Value>, StorageError> {
        match self.opt_str(col)? {
            None => Ok(None),
            Some(text) => Ok(Some(serde_json::from_str(text)?)),
        }
    }
}

fn missing(col: &str) -> StorageError {
    StorageError::InvalidData(format!("missing column '{col}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_row_ext_accessors() {
        let r = row(json!({"id": 7, "name": "core-sw", "msg": null, "data": "{\"a\":1}"}));
        assert_eq!(r.i64("id").unwrap(), 7);
        assert_eq!(r.str("name").unwrap(), "core-sw");
        assert_eq!(r.opt_str("msg").unwrap(), None);
        assert_eq!(r.json("data").unwrap(), Some(json!({"a": 1})));
        assert_eq!(r.json("msg").unwrap(), None);
    }

    #[test]
    fn test_row_ext_errors() {
        let r = row(json!({"id": "x", "msg": null}));
        assert!(matches!(r.i64("id"), Err(StorageError::InvalidData(_))));
        assert!(matches!(r.i64("msg"), Err(StorageError::InvalidData(_))));
        assert!(matches!(r.str("absent"), Err(StorageError::InvalidData(_))));
    }
}
