//! Configuration module for netwatch.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Database settings (url, pool size)
//! - Plugin, probe, scheduler, aggregator and discovery settings

mod app;
mod validation;

pub use app::{AppConfig, DEFAULT_DATABASE_URL, DatabaseConfig, ServerConfig};
pub use validation::{ConfigError, expand_env_vars};
