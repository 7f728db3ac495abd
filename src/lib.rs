//! netwatch - Network Discovery and Metric Polling
//!
//! Given device address ranges and login credentials, netwatch finds which
//! hosts are reachable, collects identifying and metric data through an
//! external plugin program, and schedules recurring collection per metric
//! polling interval.
//!
//! # Architecture
//!
//! - **Discovery**: address expansion, ICMP/TCP probing, discovery runs
//! - **Plugin**: subprocess line protocol (base64 JSON over stdin/stdout)
//! - **Collector**: active job registry and one timer per polling interval
//! - **Aggregator**: classifies plugin output and batches metric writes
//! - **Storage**: SQLite persistence through sqlx
//! - **Engine**: wiring, trigger channels, shutdown
//! - **Server**: operational HTTP endpoints
//!
//! # Example
//!
//! ```rust,ignore
//! use netwatch::{Engine, EngineConfig, StorageBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = StorageBuilder::new("sqlite:netwatch.db").build().await?;
//!     let (handle, engine) = Engine::start(EngineConfig::default(), storage.clone()).await?;
//!
//!     handle.run_discovery(1)?;
//!
//!     engine.shutdown().await?;
//!     storage.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod model;
pub mod plugin;
pub mod server;
pub mod storage;

pub use aggregator::{AggregatorConfig, AggregatorHandle, ResultAggregator, ResultSink};
pub use collector::{IntervalScheduler, JobRegistry, SchedulerConfig};
pub use config::{AppConfig, ConfigError};
pub use discovery::{DiscoveryConfig, DiscoveryRunner, ProbeBackend, ProbeConfig, Prober};
pub use engine::{Engine, EngineConfig, EngineError, EngineHandle};
pub use model::{Credential, DeviceTarget, MetricJob, SystemType};
pub use plugin::{PluginConfig, PluginInvoker, PluginRequest, PluginResult};
pub use storage::{StorageBuilder, StorageError, StorageHandles};
