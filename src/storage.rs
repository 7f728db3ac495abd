//! Storage Layer
//!
//! SQLite persistence through sqlx. Every store speaks the generic
//! [`Persistence`] interface (SQL text + JSON parameters in, JSON rows out),
//! so the typed facades never touch the driver directly.
//!
//! # Components
//!
//! - [`Persistence`] / [`SqlitePool`]: generic query interface and its SQLite backend
//! - [`DiscoveryStore`]: credential profiles, discovery attempts and results
//! - [`ProvisionStore`]: provisions, metric jobs and polled metric values
//! - [`EventStore`]: event log
//! - [`StorageBuilder`] / [`StorageHandles`]: initialization and lifecycle management

mod builder;
pub mod db;
mod discovery_store;
mod error;
mod event_store;
mod provision_store;
mod types;

pub use builder::{StorageBuilder, StorageHandles};
pub use db::{Persistence, Row, SqlitePool};
pub use discovery_store::DiscoveryStore;
pub use error::StorageError;
pub use event_store::EventStore;
pub use provision_store::ProvisionStore;
pub use types::{
    DiscoveryOutcome, DiscoveryRecord, DiscoveryResultRecord, DiscoveryStatus, Event, EventKind,
    EventSeverity, MSG_HOST_UNREACHABLE, MSG_PORT_CLOSED, MetricRow, ProvisionRecord,
};
