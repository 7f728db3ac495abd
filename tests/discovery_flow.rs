//! End-to-end orchestration tests.
//!
//! A fake probe stands in for ICMP/TCP and `/bin/sh` scripts stand in for
//! the collection plugin.
#![cfg(unix)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use netwatch::discovery::{ProbeBackend, ProbeError};
use netwatch::model::{DeviceTarget, DiscoveryId, SystemType};
use netwatch::plugin::{PluginConfig, PluginResult, ResultStatus};
use netwatch::storage::{DiscoveryOutcome, DiscoveryStatus, StorageBuilder, StorageHandles};
use netwatch::{AggregatorConfig, Engine, EngineConfig, EngineHandle, SchedulerConfig};
use serde_json::json;

// =============================================================================
// Test Helpers
// =============================================================================

/// Every host answers and every port is open.
struct AllOpen;

#[async_trait::async_trait]
impl ProbeBackend for AllOpen {
    async fn ping_all(&self, addresses: &[Ipv4Addr]) -> Result<Vec<bool>, ProbeError> {
        Ok(vec![true; addresses.len()])
    }

    async fn port_open(&self, _address: Ipv4Addr, _port: u16) -> bool {
        true
    }
}

/// Plugin that consumes the request line and prints `lines`.
fn script_plugin(lines: &[String], exit_code: i32) -> PluginConfig {
    let mut script = String::from("read line; ");
    for line in lines {
        script.push_str(&format!("echo '{line}'; "));
    }
    script.push_str(&format!("exit {exit_code}"));
    PluginConfig::new("/bin/sh")
        .with_args(["-c", script.as_str()])
        .with_timeout(Duration::from_secs(10))
}

async fn start(plugin: PluginConfig) -> (StorageHandles, EngineHandle, Engine) {
    let storage = StorageBuilder::new("sqlite::memory:")
        .build()
        .await
        .expect("Failed to build storage");
    let config = EngineConfig {
        plugin,
        aggregator: AggregatorConfig {
            batch_size: 1,
            flush_interval: Duration::from_millis(200),
            ..AggregatorConfig::default()
        },
        scheduler: SchedulerConfig {
            refresh_interval: Duration::from_secs(3600),
        },
        ..EngineConfig::default()
    };
    let (handle, engine) = Engine::start_with_probe(config, storage.clone(), Arc::new(AllOpen))
        .await
        .expect("Failed to start engine");
    (storage, handle, engine)
}

async fn wait_for_status(storage: &StorageHandles, id: DiscoveryId, want: DiscoveryStatus) {
    for _ in 0..200 {
        let record = storage.discoveries.get(id).await.unwrap().unwrap();
        if record.status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("discovery {id} never reached {want}");
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_discovery_end_to_end() {
    let storage = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
    let cred = storage
        .discoveries
        .create_credential("lab", "admin", "pw", SystemType::Linux)
        .await
        .unwrap();
    let line = PluginResult {
        status: ResultStatus::Success,
        address: "10.0.0.5".to_string(),
        port: Some(22),
        credential_profile_id: Some(cred),
        provision_id: None,
        metric_type: Vec::new(),
        data: Some(json!({ "hostname": "lab-01" })),
        error: None,
    }
    .encode()
    .unwrap();

    let config = EngineConfig {
        plugin: script_plugin(&[line], 0),
        ..EngineConfig::default()
    };
    let (handle, engine) = Engine::start_with_probe(config, storage.clone(), Arc::new(AllOpen))
        .await
        .unwrap();

    let id = storage
        .discoveries
        .create_discovery("lab", "10.0.0.5", 22, &[cred])
        .await
        .unwrap();
    handle.run_discovery(id).unwrap();
    wait_for_status(&storage, id, DiscoveryStatus::Completed).await;

    let results = storage.discoveries.results(id).await.unwrap();
    assert_eq!(results.len(), 1);
    let row = &results[0];
    assert_eq!(row.address, "10.0.0.5");
    assert_eq!(row.result, DiscoveryOutcome::Completed);
    assert_eq!(row.credential_profile_id, Some(cred));
    assert_eq!(row.msg, None);
    assert_eq!(row.data, Some(json!({ "hostname": "lab-01" })));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plugin_crash_records_failure() {
    let (storage, handle, engine) = start(script_plugin(&[], 3)).await;
    let cred = storage
        .discoveries
        .create_credential("lab", "admin", "pw", SystemType::Linux)
        .await
        .unwrap();
    let id = storage
        .discoveries
        .create_discovery("lab", "10.0.0.5", 22, &[cred])
        .await
        .unwrap();

    handle.run_discovery(id).unwrap();
    wait_for_status(&storage, id, DiscoveryStatus::Completed).await;

    let results = storage.discoveries.results(id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].result, DiscoveryOutcome::Failed);
    assert!(!results[0].msg.as_deref().unwrap_or_default().is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_range_marks_failed() {
    let (storage, handle, engine) = start(script_plugin(&[], 0)).await;
    let cred = storage
        .discoveries
        .create_credential("lab", "admin", "pw", SystemType::Linux)
        .await
        .unwrap();
    let id = storage
        .discoveries
        .create_discovery("bad", "10.0.0.9-10.0.0.1", 22, &[cred])
        .await
        .unwrap();

    handle.run_discovery(id).unwrap();
    wait_for_status(&storage, id, DiscoveryStatus::Failed).await;
    assert!(storage.discoveries.results(id).await.unwrap().is_empty());

    engine.shutdown().await.unwrap();
}

// =============================================================================
// Polling
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_polling_persists_metric_rows() {
    let storage = StorageBuilder::new("sqlite::memory:").build().await.unwrap();
    let cred = storage
        .discoveries
        .create_credential("lab", "admin", "pw", SystemType::Linux)
        .await
        .unwrap();
    let target = DeviceTarget::new("10.0.0.7", 22).unwrap();
    let pid = storage
        .provisions
        .create_provision(&target, cred, None)
        .await
        .unwrap();

    let line = PluginResult {
        status: ResultStatus::Success,
        address: "10.0.0.7".to_string(),
        port: Some(22),
        credential_profile_id: Some(cred),
        provision_id: Some(pid),
        metric_type: vec!["cpu".to_string()],
        data: Some(json!({ "cpu": { "usage": 12.5 } })),
        error: None,
    }
    .encode()
    .unwrap();

    let config = EngineConfig {
        plugin: script_plugin(&[line], 0),
        aggregator: AggregatorConfig {
            batch_size: 1,
            ..AggregatorConfig::default()
        },
        scheduler: SchedulerConfig {
            refresh_interval: Duration::from_secs(3600),
        },
        ..EngineConfig::default()
    };
    let (handle, engine) = Engine::start_with_probe(config, storage.clone(), Arc::new(AllOpen))
        .await
        .unwrap();

    storage
        .provisions
        .upsert_metric_job(pid, "cpu", 1, true)
        .await
        .unwrap();
    handle.provision_created(pid).unwrap();

    let mut rows = Vec::new();
    for _ in 0..100 {
        rows = storage.provisions.metric_rows(pid, 10).await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!rows.is_empty(), "no metric rows persisted");
    assert_eq!(rows[0].address, "10.0.0.7");
    assert_eq!(rows[0].metrics, vec!["cpu"]);
    assert_eq!(rows[0].data["cpu"]["usage"], 12.5);

    engine.shutdown().await.unwrap();
}
