//! Core data types for the storage layer.
//!
//! - [`DiscoveryRecord`] / [`DiscoveryStatus`]: discovery attempts and their lifecycle
//! - [`DiscoveryResultRecord`] / [`DiscoveryOutcome`]: per-host discovery outcome
//! - [`ProvisionRecord`]: device promoted into polling
//! - [`MetricRow`]: one successful polling result
//! - [`Event`]: structured event records for job-state transitions and errors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::model::{CredentialId, DiscoveryId, ProvisionId};
use crate::plugin::PluginResult;

/// Failure reason recorded for hosts that do not answer ICMP echo.
pub const MSG_HOST_UNREACHABLE: &str = "host unreachable";
/// Failure reason recorded for live hosts whose target port is closed.
pub const MSG_PORT_CLOSED: &str = "port closed";

// =============================================================================
// Discovery
// =============================================================================

/// Lifecycle of a discovery attempt.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DiscoveryStatus {
    /// Created, never run.
    #[default]
    Pending,
    /// Probing or waiting for the plugin.
    Running,
    /// Plugin invocation finished.
    Completed,
    /// Pipeline aborted before the plugin finished.
    Failed,
}

impl DiscoveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A discovery attempt with its candidate credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    pub id: DiscoveryId,
    pub name: String,
    /// Single address, dashed range or CIDR block.
    pub address: String,
    pub port: u16,
    pub status: DiscoveryStatus,
    pub credential_ids: Vec<CredentialId>,
}

/// Per-host result classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum DiscoveryOutcome {
    /// Login succeeded with `credential_profile_id`.
    Completed,
    /// Host unreachable, port closed, or no credential worked.
    Failed,
}

/// One row of `discovery_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResultRecord {
    pub discovery_id: DiscoveryId,
    pub address: String,
    pub port: u16,
    pub credential_profile_id: Option<CredentialId>,
    pub result: DiscoveryOutcome,
    /// Failure reason; `None` on success.
    pub msg: Option<String>,
    /// Identifying data returned by the plugin.
    pub data: Option<serde_json::Value>,
}

impl DiscoveryResultRecord {
    /// Negative result for a host that never reached the plugin.
    pub fn failure(
        discovery_id: DiscoveryId,
        address: impl Into<String>,
        port: u16,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            discovery_id,
            address: address.into(),
            port,
            credential_profile_id: None,
            result: DiscoveryOutcome::Failed,
            msg: Some(msg.into()),
            data: None,
        }
    }

    /// Convert a plugin result of a discovery invocation.
    ///
    /// `default_port` is used when the plugin does not echo the port.
    pub fn from_plugin(discovery_id: DiscoveryId, default_port: u16, result: PluginResult) -> Self {
        let success = result.is_success();
        Self {
            discovery_id,
            port: result.port.unwrap_or(default_port),
            credential_profile_id: result.credential_profile_id,
            result: if success {
                DiscoveryOutcome::Completed
            } else {
                DiscoveryOutcome::Failed
            },
            msg: (!success).then(|| result.error_message()),
            data: if success { result.data } else { None },
            address: result.address,
        }
    }
}

// =============================================================================
// Polling
// =============================================================================

/// A device promoted from discovery into polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRecord {
    pub id: ProvisionId,
    pub address: String,
    pub port: u16,
    pub credential_id: CredentialId,
    pub discovery_id: Option<DiscoveryId>,
}

/// One successful polling result, persisted in bulk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub ts: DateTime<Utc>,
    pub provision_id: ProvisionId,
    pub address: String,
    /// Metric names covered by `data`.
    pub metrics: Vec<String>,
    pub data: serde_json::Value,
}

impl MetricRow {
    /// Build a row from a successful polling result.
    ///
    /// Returns `None` when the result is a failure or lacks a provision id.
    pub fn from_plugin(result: PluginResult) -> Option<Self> {
        if !result.is_success() {
            return None;
        }
        Some(Self {
            ts: Utc::now(),
            provision_id: result.provision_id?,
            address: result.address,
            metrics: result.metric_type,
            data: result.data.unwrap_or(serde_json::Value::Null),
        })
    }
}

// =============================================================================
// Events
// =============================================================================

/// An event record stored in the `events` table.
///
/// Events represent discrete occurrences in the system, such as timers being
/// started or cancelled and discovery attempts changing state. Each event has
/// a source identifier, type classification, and severity level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Auto-generated event identifier.
    pub id: Option<i64>,
    /// Event timestamp (UTC).
    pub ts: DateTime<Utc>,
    /// Event origin (e.g., "collector.scheduler", "discovery.runner").
    pub source: String,
    /// Event nature/handling class.
    pub kind: EventKind,
    /// Delivery priority/urgency.
    pub severity: EventSeverity,
    /// Short human-readable description.
    pub message: String,
    /// Context snapshot as JSON.
    pub payload: Option<serde_json::Value>,
}

impl Event {
    /// New system event timestamped now.
    pub fn system(
        source: impl Into<String>,
        severity: EventSeverity,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            ts: Utc::now(),
            source: source.into(),
            kind: EventKind::System,
            severity,
            message: message.into(),
            payload: Some(payload),
        }
    }

    /// Override the kind.
    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Event kind classification.
///
/// Categorizes events by their nature and intended handling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventKind {
    /// Notification that needs operator attention.
    Alert,
    /// Component error requiring attention.
    Error,
    /// Internal system event (e.g., timer started, discovery completed).
    System,
    /// Audit trail entry for tracking actions.
    Audit,
}

/// Event severity classification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EventSeverity {
    /// Verbose diagnostic information (development only).
    Debug,
    /// Normal operational information.
    Info,
    /// Potential issue that may require attention.
    Warn,
    /// Error condition requiring investigation.
    Error,
    /// Severe failure requiring immediate action.
    Critical,
}
