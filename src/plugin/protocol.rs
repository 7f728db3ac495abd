//! Plugin wire protocol.
//!
//! One request line in, zero or more result lines out. Every line is the
//! standard (padded) base64 encoding of a UTF-8 JSON document.
//!
//! Request:
//!
//! ```json
//! {"category":"polling","targets":[{"ip.address":"10.0.0.5","port":22,
//!   "user":"admin","password":"...","system_type":"linux",
//!   "provision_id":7,"metric_type":["cpu","memory"]}]}
//! ```
//!
//! Result:
//!
//! ```json
//! {"status":"success","ip.address":"10.0.0.5","port":22,
//!  "provision_id":7,"metric_type":["cpu","memory"],"data":{"cpu":12.5}}
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::model::{Credential, CredentialId, DeviceTarget, DiscoveryId, ProvisionId, SystemType};
use crate::plugin::PluginError;

/// Kind of work a plugin invocation performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    /// Credentialed login attempt against a freshly probed host.
    Discovery,
    /// Recurring metric collection from a provisioned device.
    Polling,
}

/// Outcome reported by the plugin for one target.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// One device the plugin should connect to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginTarget {
    #[serde(rename = "ip.address")]
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub system_type: SystemType,
    /// Discovery only: credential under test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_profile_id: Option<CredentialId>,
    /// Polling only: parent provision of the collected metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_id: Option<ProvisionId>,
    /// Polling only: metrics to collect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_type: Vec<String>,
}

impl PluginTarget {
    /// Target for a credentialed discovery login.
    pub fn discovery(target: &DeviceTarget, credential: &Credential) -> Self {
        Self {
            address: target.address.clone(),
            port: target.port,
            user: credential.username.clone(),
            password: credential.secret.clone(),
            system_type: credential.system_type,
            credential_profile_id: Some(credential.id),
            provision_id: None,
            metric_type: Vec::new(),
        }
    }

    /// Target for collecting `metrics` from a provisioned device.
    pub fn polling(
        provision_id: ProvisionId,
        target: &DeviceTarget,
        credential: &Credential,
        metrics: Vec<String>,
    ) -> Self {
        Self {
            address: target.address.clone(),
            port: target.port,
            user: credential.username.clone(),
            password: credential.secret.clone(),
            system_type: credential.system_type,
            credential_profile_id: Some(credential.id),
            provision_id: Some(provision_id),
            metric_type: metrics,
        }
    }
}

/// A batch of targets handled by a single plugin process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRequest {
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_id: Option<DiscoveryId>,
    pub targets: Vec<PluginTarget>,
}

impl PluginRequest {
    pub fn discovery(discovery_id: DiscoveryId, targets: Vec<PluginTarget>) -> Self {
        Self {
            category: Category::Discovery,
            discovery_id: Some(discovery_id),
            targets,
        }
    }

    pub fn polling(targets: Vec<PluginTarget>) -> Self {
        Self {
            category: Category::Polling,
            discovery_id: None,
            targets,
        }
    }

    /// Encode as one protocol line (without the trailing newline).
    pub fn encode(&self) -> Result<String, PluginError> {
        let json = serde_json::to_vec(self)?;
        Ok(STANDARD.encode(json))
    }
}

/// One result line emitted by the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    pub status: ResultStatus,
    #[serde(rename = "ip.address")]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_profile_id: Option<CredentialId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_id: Option<ProvisionId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_type: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginResult {
    /// Failure result correlated with `target`.
    pub fn failure_for(target: &PluginTarget, error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            address: target.address.clone(),
            port: Some(target.port),
            credential_profile_id: target.credential_profile_id,
            provision_id: target.provision_id,
            metric_type: target.metric_type.clone(),
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Failure reason, or a generic message when the plugin sent none.
    pub fn error_message(&self) -> String {
        match self.error.as_deref() {
            Some(msg) if !msg.is_empty() => msg.to_string(),
            _ => "plugin reported failure without an error message".to_string(),
        }
    }

    /// Decode one protocol line.
    pub fn decode(line: &str) -> Result<Self, PluginError> {
        let bytes = STANDARD
            .decode(line.trim())
            .map_err(|e| PluginError::Decode(format!("invalid base64: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| PluginError::Decode(format!("invalid utf-8: {e}")))?;
        serde_json::from_str(&text).map_err(|e| PluginError::Decode(format!("invalid json: {e}")))
    }

    /// Encode as one protocol line. Used by test plugins and tooling.
    pub fn encode(&self) -> Result<String, PluginError> {
        Ok(STANDARD.encode(serde_json::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential::new(3, "admin", "s3cret", SystemType::Linux)
    }

    #[test]
    fn test_request_wire_shape() {
        let target = DeviceTarget::new("10.0.0.5", 22).unwrap();
        let request = PluginRequest::polling(vec![PluginTarget::polling(
            7,
            &target,
            &credential(),
            vec!["cpu".into(), "memory".into()],
        )]);

        let line = request.encode().unwrap();
        assert!(!line.contains('\n'));

        let json: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(&line).unwrap()).unwrap();
        assert_eq!(json["category"], "polling");
        let t = &json["targets"][0];
        assert_eq!(t["ip.address"], "10.0.0.5");
        assert_eq!(t["port"], 22);
        assert_eq!(t["user"], "admin");
        assert_eq!(t["password"], "s3cret");
        assert_eq!(t["provision_id"], 7);
        assert_eq!(t["metric_type"], serde_json::json!(["cpu", "memory"]));
    }

    #[test]
    fn test_discovery_target_carries_credential_id() {
        let target = DeviceTarget::new("10.0.0.9", 2222).unwrap();
        let request = PluginRequest::discovery(11, vec![PluginTarget::discovery(&target, &credential())]);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["category"], "discovery");
        assert_eq!(json["discovery_id"], 11);
        assert_eq!(json["targets"][0]["credential_profile_id"], 3);
        assert!(json["targets"][0].get("metric_type").is_none());
    }

    #[test]
    fn test_decode_result_line() {
        let json = r#"{"status":"success","ip.address":"10.0.0.5","credential_profile_id":3,"data":{"hostname":"web-1"}}"#;
        let line = format!("{}\n", STANDARD.encode(json));

        let result = PluginResult::decode(&line).unwrap();
        assert!(result.is_success());
        assert_eq!(result.address, "10.0.0.5");
        assert_eq!(result.credential_profile_id, Some(3));
        assert_eq!(result.data.unwrap()["hostname"], "web-1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            PluginResult::decode("%%% not base64"),
            Err(PluginError::Decode(_))
        ));
        let not_json = STANDARD.encode("hello");
        assert!(matches!(
            PluginResult::decode(&not_json),
            Err(PluginError::Decode(_))
        ));
        let missing_status = STANDARD.encode(r#"{"ip.address":"10.0.0.5"}"#);
        assert!(PluginResult::decode(&missing_status).is_err());
    }

    #[test]
    fn test_failure_for_copies_correlation() {
        let target = DeviceTarget::new("10.0.0.5", 22).unwrap();
        let t = PluginTarget::polling(7, &target, &credential(), vec!["cpu".into()]);
        let result = PluginResult::failure_for(&t, "boom");

        assert_eq!(result.status, ResultStatus::Failure);
        assert_eq!(result.provision_id, Some(7));
        assert_eq!(result.metric_type, vec!["cpu".to_string()]);
        assert_eq!(result.error_message(), "boom");
    }
}
