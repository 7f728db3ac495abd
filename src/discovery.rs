//! Discovery Layer
//!
//! Turns an address expression and a set of candidate credentials into
//! per-host discovery results:
//! - [`range`]: address expression expansion
//! - [`prober`]: ICMP liveness and TCP port checks
//! - [`DiscoveryRunner`]: drives one attempt through its lifecycle and hands
//!   live hosts to the plugin

pub mod prober;
pub mod range;
mod runner;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{DiscoveryId, TargetError};
use crate::storage::StorageError;

pub use prober::{NetworkProbe, ProbeBackend, ProbeConfig, ProbeError, Prober, Reachability};
pub use range::{AddressRange, InvalidInputError, parse_bounded, resolve, resolve_bounded};
pub use runner::{DiscoveryRun, DiscoveryRunner};

/// Default upper bound on hosts expanded from one address expression.
pub const DEFAULT_MAX_HOSTS: u64 = 65_536;

fn default_max_hosts() -> u64 {
    DEFAULT_MAX_HOSTS
}

/// Discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Largest expansion accepted for one attempt (default: 65536).
    #[serde(default = "default_max_hosts")]
    pub max_hosts: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_hosts: DEFAULT_MAX_HOSTS,
        }
    }
}

/// Errors that abort a discovery run.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery {0} not found")]
    NotFound(DiscoveryId),

    #[error("discovery {0} has no usable credentials")]
    NoCredentials(DiscoveryId),

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    #[error("invalid target: {0}")]
    Target(#[from] TargetError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
