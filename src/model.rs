//! Core domain types shared by the discovery and polling paths.
//!
//! - [`DeviceTarget`]: validated IPv4 address + port pair
//! - [`Credential`]: immutable credential snapshot attached to a target
//! - [`MetricJob`]: one metric collected from one device at a fixed interval

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Identifier of a metric job.
pub type JobId = i64;
/// Identifier of a provisioned device (parent of metric jobs).
pub type ProvisionId = i64;
/// Identifier of a credential profile.
pub type CredentialId = i64;
/// Identifier of a discovery attempt.
pub type DiscoveryId = i64;

/// Port assumed when none is given (SSH).
pub const DEFAULT_PORT: u16 = 22;

/// Errors raised while validating a device target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    /// Address is not a dotted-quad IPv4 address.
    #[error("invalid IPv4 address: '{0}'")]
    InvalidAddress(String),

    /// Port outside 1-65535.
    #[error("invalid port {0}: must be in 1-65535")]
    InvalidPort(u32),
}

/// Parse a dotted-quad IPv4 address.
///
/// Leading/trailing whitespace is ignored; anything else that is not a strict
/// IPv4 literal (hostnames, IPv6, octets > 255) is rejected.
pub fn validate_ipv4(address: &str) -> Result<Ipv4Addr, TargetError> {
    address
        .trim()
        .parse::<Ipv4Addr>()
        .map_err(|_| TargetError::InvalidAddress(address.to_string()))
}

/// Validate a port number coming from an untyped source (config, database row).
pub fn validate_port(port: i64) -> Result<u16, TargetError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or(TargetError::InvalidPort(port.clamp(0, i64::from(u32::MAX)) as u32))
}

/// A reachable endpoint on a managed device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// IPv4 address in dotted-quad notation.
    pub address: String,
    /// Service port (SSH by default).
    pub port: u16,
}

impl DeviceTarget {
    /// Create a target, validating both address and port.
    pub fn new(address: impl AsRef<str>, port: u16) -> Result<Self, TargetError> {
        let ip = validate_ipv4(address.as_ref())?;
        if port == 0 {
            return Err(TargetError::InvalidPort(0));
        }
        Ok(Self {
            address: ip.to_string(),
            port,
        })
    }

    /// Parsed socket address of this target.
    pub fn socket_addr(&self) -> Result<SocketAddrV4, TargetError> {
        Ok(SocketAddrV4::new(validate_ipv4(&self.address)?, self.port))
    }
}

impl std::fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Operating system family a credential applies to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SystemType {
    #[default]
    Linux,
    Windows,
    Snmp,
}

/// Credential snapshot handed to the plugin.
///
/// Held by value: once attached to a discovery attempt or a metric job it is
/// never mutated in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Credential profile id.
    pub id: CredentialId,
    /// Login user.
    pub username: String,
    /// Login secret.
    pub secret: String,
    /// Target system family.
    pub system_type: SystemType,
}

impl Credential {
    pub fn new(
        id: CredentialId,
        username: impl Into<String>,
        secret: impl Into<String>,
        system_type: SystemType,
    ) -> Self {
        Self {
            id,
            username: username.into(),
            secret: secret.into(),
            system_type,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("system_type", &self.system_type)
            .finish_non_exhaustive()
    }
}

/// One metric polled from one provisioned device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricJob {
    /// Unique job id.
    pub id: JobId,
    /// Parent provision; all jobs of a provision share target and credential.
    pub parent_id: ProvisionId,
    /// Metric name understood by the plugin (e.g. `cpu`, `memory`).
    pub metric: String,
    /// Device endpoint.
    pub target: DeviceTarget,
    /// Credential snapshot.
    pub credential: Credential,
    /// Polling interval in seconds.
    pub interval_secs: u64,
    /// Whether the job should be scheduled.
    pub enabled: bool,
}

impl MetricJob {
    /// Polling interval as a duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
