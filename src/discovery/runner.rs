//! Discovery runner.
//!
//! One run: load the attempt and its credentials, mark it `running`, expand
//! the address expression, probe every host, record negative results for
//! unreachable hosts and closed ports, then submit one plugin request holding
//! every (live host × credential) pair. The aggregator marks the attempt
//! `completed` when that invocation finishes.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::aggregator::AggregatorHandle;
use crate::discovery::{DiscoveryConfig, DiscoveryError, Prober, resolve_bounded};
use crate::model::{DeviceTarget, DiscoveryId};
use crate::plugin::{Dispatch, PluginRequest, PluginTarget};
use crate::storage::{
    DiscoveryRecord, DiscoveryResultRecord, DiscoveryStatus, DiscoveryStore, Event, EventKind,
    EventSeverity, MSG_HOST_UNREACHABLE, MSG_PORT_CLOSED,
};

/// Static event source tag for discovery events.
const RUNNER_EVENT_SOURCE: &str = "discovery.runner";

/// Summary of the synchronous part of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryRun {
    pub discovery_id: DiscoveryId,
    /// Addresses produced by the expansion.
    pub hosts: usize,
    pub unreachable: usize,
    pub port_closed: usize,
    /// Plugin targets submitted (live hosts × credentials).
    pub targets: usize,
}

/// Drives discovery attempts.
#[derive(Clone)]
pub struct DiscoveryRunner {
    store: DiscoveryStore,
    prober: Prober,
    dispatch: Arc<dyn Dispatch>,
    output: AggregatorHandle,
    config: DiscoveryConfig,
}

impl std::fmt::Debug for DiscoveryRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryRunner")
            .field("prober", &self.prober)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DiscoveryRunner {
    pub fn new(
        store: DiscoveryStore,
        prober: Prober,
        dispatch: Arc<dyn Dispatch>,
        output: AggregatorHandle,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            store,
            prober,
            dispatch,
            output,
            config,
        }
    }

    /// Run one discovery attempt.
    ///
    /// Returns once the plugin request has been submitted. Any failure after
    /// the attempt entered `running` leaves it `failed`.
    pub async fn run(&self, id: DiscoveryId) -> Result<DiscoveryRun, DiscoveryError> {
        let record = self
            .store
            .get(id)
            .await?
            .ok_or(DiscoveryError::NotFound(id))?;

        self.store.set_status(id, DiscoveryStatus::Running).await?;
        tracing::info!(discovery_id = id, address = %record.address, port = record.port, "Discovery started");
        self.emit(
            EventSeverity::Info,
            format!("Discovery {id} started"),
            json!({ "discovery_id": id, "address": record.address, "port": record.port }),
        );

        match self.execute(&record).await {
            Ok(run) => {
                tracing::info!(
                    discovery_id = id,
                    hosts = run.hosts,
                    unreachable = run.unreachable,
                    port_closed = run.port_closed,
                    targets = run.targets,
                    "Discovery probing finished"
                );
                Ok(run)
            }
            Err(e) => {
                tracing::error!(discovery_id = id, error = %e, "Discovery failed");
                if let Err(se) = self.store.set_status(id, DiscoveryStatus::Failed).await {
                    tracing::error!(discovery_id = id, error = %se, "Discovery status update failed");
                }
                self.output.event(
                    Event::system(
                        RUNNER_EVENT_SOURCE,
                        EventSeverity::Error,
                        format!("Discovery {id} failed"),
                        json!({ "discovery_id": id, "error": e.to_string() }),
                    )
                    .with_kind(EventKind::Error),
                );
                Err(e)
            }
        }
    }

    async fn execute(&self, record: &DiscoveryRecord) -> Result<DiscoveryRun, DiscoveryError> {
        let id = record.id;
        self.store.clear_results(id).await?;

        let credentials = self.store.credentials(&record.credential_ids).await?;
        if credentials.is_empty() {
            return Err(DiscoveryError::NoCredentials(id));
        }

        let addresses = resolve_bounded(&record.address, self.config.max_hosts)?;
        let reachability = self.prober.probe(&addresses, record.port).await;

        let mut run = DiscoveryRun {
            discovery_id: id,
            hosts: addresses.len(),
            ..DiscoveryRun::default()
        };
        let mut targets = Vec::new();
        let mut failures = Vec::new();

        for host in reachability {
            let msg = if !host.reachable {
                run.unreachable += 1;
                MSG_HOST_UNREACHABLE
            } else if !host.port_open {
                run.port_closed += 1;
                MSG_PORT_CLOSED
            } else {
                let device = DeviceTarget::new(&host.address, record.port)?;
                targets.extend(credentials.iter().map(|c| PluginTarget::discovery(&device, c)));
                continue;
            };
            failures.push(DiscoveryResultRecord::failure(id, host.address, record.port, msg));
        }
        self.store.upsert_results(&failures).await?;

        run.targets = targets.len();
        let request = PluginRequest::discovery(id, targets);
        if request.targets.is_empty() {
            // Nothing for the plugin; the aggregator completes the attempt.
            self.output.invocation_complete(request).await;
        } else {
            self.dispatch.submit(request);
        }
        Ok(run)
    }

    fn emit(&self, severity: EventSeverity, message: String, payload: serde_json::Value) {
        self.output
            .event(Event::system(RUNNER_EVENT_SOURCE, severity, message, payload));
    }
}
