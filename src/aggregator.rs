//! Result Aggregator
//!
//! Single-writer actor that turns streamed plugin output into persistence
//! calls:
//! - discovery results are written through one at a time
//! - successful polling results are buffered and flushed in bulk when the
//!   buffer reaches `batch_size` items or `flush_interval` elapses
//! - failed polling results are logged and dropped
//! - an invocation-complete signal for a discovery request marks the attempt
//!   `completed`
//!
//! The buffer is owned by the actor task, so flush-then-clear can never race
//! with an append.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::model::{DEFAULT_PORT, DiscoveryId};
use crate::plugin::{Category, PluginRequest, PluginResult};
use crate::storage::{
    DiscoveryResultRecord, DiscoveryStatus, Event, EventSeverity, MetricRow, StorageError,
};

// =============================================================================
// Constants
// =============================================================================

/// Default number of metric rows that triggers a flush.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default maximum age of a non-empty buffer.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// Default command channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Idle wake-up when the buffer is empty.
const IDLE_TICK: Duration = Duration::from_secs(60);

/// Static event source tag for aggregator events.
const AGGREGATOR_EVENT_SOURCE: &str = "aggregator";

// =============================================================================
// Configuration
// =============================================================================

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

/// Batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Rows buffered before a bulk write (default: 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum age of a non-empty buffer (default: 15s).
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Command channel capacity (default: 10000).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Where aggregated output is written.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync + 'static {
    /// Insert or merge one per-host discovery result.
    async fn write_discovery_result(&self, record: DiscoveryResultRecord)
    -> Result<(), StorageError>;

    /// Bulk insert polled metric rows.
    async fn write_metric_rows(&self, rows: Vec<MetricRow>) -> Result<u64, StorageError>;

    /// Persist a discovery status transition.
    async fn set_discovery_status(
        &self,
        id: DiscoveryId,
        status: DiscoveryStatus,
    ) -> Result<(), StorageError>;

    /// Append to the event log.
    async fn write_event(&self, event: Event) -> Result<(), StorageError>;
}

// =============================================================================
// Commands
// =============================================================================

/// Commands sent to the aggregator actor.
#[derive(Debug)]
pub enum Command {
    /// One decoded (or synthesized) plugin result.
    Result {
        category: Category,
        discovery_id: Option<DiscoveryId>,
        result: PluginResult,
    },
    /// A plugin invocation finished; carries the original request.
    InvocationComplete(PluginRequest),
    /// Event (immediate insert).
    Event(Event),
    /// Force flush; acknowledged once the write finished.
    Flush(oneshot::Sender<()>),
    /// Flush and stop.
    Shutdown,
}

// =============================================================================
// Buffer
// =============================================================================

/// Buffer for batch inserts with time-based and size-based flushing.
struct BatchBuffer<T> {
    items: Vec<T>,
    last_flush: Instant,
    size_threshold: usize,
    time_threshold: Duration,
}

impl<T> BatchBuffer<T> {
    fn new(size_threshold: usize, time_threshold: Duration) -> Self {
        Self {
            items: Vec::with_capacity(size_threshold),
            last_flush: Instant::now(),
            size_threshold: size_threshold.max(1),
            time_threshold,
        }
    }

    fn push(&mut self, item: T) {
        // Reset flush timer on first item to avoid treating long-idle buffers as overdue
        if self.items.is_empty() {
            self.last_flush = Instant::now();
        }
        self.items.push(item);
    }

    fn should_flush(&self) -> bool {
        self.items.len() >= self.size_threshold
            || (!self.items.is_empty() && self.last_flush.elapsed() >= self.time_threshold)
    }

    fn deadline(&self) -> Instant {
        if self.items.is_empty() {
            Instant::now() + IDLE_TICK
        } else {
            self.last_flush + self.time_threshold
        }
    }

    fn take(&mut self) -> Vec<T> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.items)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Aggregator actor; see the module docs.
pub struct ResultAggregator {
    sink: Arc<dyn ResultSink>,
    rx: mpsc::Receiver<Command>,
    buffer: BatchBuffer<MetricRow>,
}

impl ResultAggregator {
    /// Spawn the actor task.
    pub fn spawn(
        config: &AggregatorConfig,
        sink: Arc<dyn ResultSink>,
    ) -> (AggregatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let actor = Self {
            sink,
            rx,
            buffer: BatchBuffer::new(config.batch_size, config.flush_interval),
        };
        let handle = tokio::spawn(actor.run());
        (AggregatorHandle::from_sender(tx), handle)
    }

    async fn run(mut self) {
        tracing::info!("Aggregator started");

        loop {
            let deadline = self.buffer.deadline();
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break; // Shutdown requested
                        }
                    }
                    None => {
                        tracing::warn!("Channel disconnected, shutting down");
                        self.flush().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    // Timeout: flush overdue
                }
            }

            if self.buffer.should_flush() {
                self.flush().await;
            }
        }

        tracing::info!("Aggregator stopped");
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Result {
                category: Category::Discovery,
                discovery_id,
                result,
            } => match discovery_id {
                Some(id) => {
                    let record = DiscoveryResultRecord::from_plugin(id, DEFAULT_PORT, result);
                    self.write_discovery_result(record).await;
                }
                None => {
                    tracing::warn!(ip = %result.address, "Discovery result without discovery id, dropping");
                }
            },
            Command::Result {
                category: Category::Polling,
                result,
                ..
            } => {
                if !result.is_success() {
                    tracing::warn!(
                        ip = %result.address,
                        provision_id = ?result.provision_id,
                        metrics = ?result.metric_type,
                        error = %result.error_message(),
                        "Polling failed"
                    );
                    return false;
                }
                match MetricRow::from_plugin(result) {
                    Some(row) => self.buffer.push(row),
                    None => tracing::warn!("Polling result without provision id, dropping"),
                }
            }
            Command::InvocationComplete(request) => self.complete(request).await,
            Command::Event(event) => {
                if let Err(e) = self.sink.write_event(event).await {
                    tracing::error!(error = %e, "Event insert failed");
                }
            }
            Command::Flush(ack) => {
                self.flush().await;
                let _ = ack.send(());
            }
            Command::Shutdown => {
                tracing::info!("Aggregator shutting down");
                self.flush().await;
                return true;
            }
        }
        false
    }

    async fn complete(&mut self, request: PluginRequest) {
        match (request.category, request.discovery_id) {
            (Category::Discovery, Some(id)) => {
                if let Err(e) = self
                    .sink
                    .set_discovery_status(id, DiscoveryStatus::Completed)
                    .await
                {
                    tracing::error!(discovery_id = id, error = %e, "Discovery status update failed");
                    return;
                }
                tracing::info!(discovery_id = id, targets = request.targets.len(), "Discovery completed");
                let event = Event::system(
                    AGGREGATOR_EVENT_SOURCE,
                    EventSeverity::Info,
                    format!("Discovery {id} completed"),
                    serde_json::json!({ "discovery_id": id, "targets": request.targets.len() }),
                );
                if let Err(e) = self.sink.write_event(event).await {
                    tracing::error!(error = %e, "Event insert failed");
                }
            }
            (category, _) => {
                tracing::debug!(%category, targets = request.targets.len(), "Invocation complete");
            }
        }
    }

    async fn write_discovery_result(&self, record: DiscoveryResultRecord) {
        let (id, ip) = (record.discovery_id, record.address.clone());
        if let Err(e) = self.sink.write_discovery_result(record).await {
            tracing::error!(discovery_id = id, ip = %ip, error = %e, "Discovery result write failed");
        }
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let count = self.buffer.len();
        let rows = self.buffer.take();
        match self.sink.write_metric_rows(rows).await {
            Ok(_) => tracing::debug!(count, "Metric rows flushed"),
            Err(e) => tracing::error!(error = %e, count, "Metric rows batch insert failed"),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable sender side of the aggregator.
///
/// Results and completion signals wait for channel capacity; events use
/// `try_send` and are dropped (and counted) when the channel is full.
#[derive(Clone)]
pub struct AggregatorHandle {
    tx: mpsc::Sender<Command>,
    dropped_events: Arc<AtomicU64>,
}

impl std::fmt::Debug for AggregatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatorHandle")
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl AggregatorHandle {
    pub(crate) fn from_sender(tx: mpsc::Sender<Command>) -> Self {
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get total count of dropped events due to channel capacity.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Forward one plugin result.
    pub async fn plugin_result(
        &self,
        category: Category,
        discovery_id: Option<DiscoveryId>,
        result: PluginResult,
    ) {
        self.send(Command::Result {
            category,
            discovery_id,
            result,
        })
        .await;
    }

    /// Signal the end of a plugin invocation.
    pub async fn invocation_complete(&self, request: PluginRequest) {
        self.send(Command::InvocationComplete(request)).await;
    }

    /// Record an event. Never blocks.
    pub fn event(&self, event: Event) {
        if self.tx.try_send(Command::Event(event)).is_err() {
            tracing::warn!("Channel full, dropping event");
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Flush buffered rows and wait until the write finished.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        self.send(Command::Flush(ack)).await;
        let _ = done.await;
    }

    /// Ask the actor to flush and stop.
    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    async fn send(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            tracing::warn!("Aggregator stopped, dropping command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ResultStatus;
    use crate::storage::DiscoveryOutcome;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        discovery: Mutex<Vec<DiscoveryResultRecord>>,
        flushes: Mutex<Vec<Vec<MetricRow>>>,
        statuses: Mutex<Vec<(DiscoveryId, DiscoveryStatus)>>,
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn flush_sizes(&self) -> Vec<usize> {
            self.flushes.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait::async_trait]
    impl ResultSink for RecordingSink {
        async fn write_discovery_result(
            &self,
            record: DiscoveryResultRecord,
        ) -> Result<(), StorageError> {
            self.discovery.lock().unwrap().push(record);
            Ok(())
        }

        async fn write_metric_rows(&self, rows: Vec<MetricRow>) -> Result<u64, StorageError> {
            let n = rows.len() as u64;
            self.flushes.lock().unwrap().push(rows);
            Ok(n)
        }

        async fn set_discovery_status(
            &self,
            id: DiscoveryId,
            status: DiscoveryStatus,
        ) -> Result<(), StorageError> {
            self.statuses.lock().unwrap().push((id, status));
            Ok(())
        }

        async fn write_event(&self, event: Event) -> Result<(), StorageError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn polling(status: ResultStatus, provision_id: i64) -> PluginResult {
        PluginResult {
            status,
            address: "10.0.0.5".into(),
            port: Some(22),
            credential_profile_id: Some(1),
            provision_id: Some(provision_id),
            metric_type: vec!["cpu".into()],
            data: Some(serde_json::json!({"cpu": 1.0})),
            error: (status == ResultStatus::Failure).then(|| "timeout".to_string()),
        }
    }

    fn spawn(
        batch_size: usize,
        flush_interval: Duration,
    ) -> (Arc<RecordingSink>, AggregatorHandle, JoinHandle<()>) {
        let sink = Arc::new(RecordingSink::default());
        let config = AggregatorConfig {
            batch_size,
            flush_interval,
            channel_capacity: 1024,
        };
        let (handle, task) = ResultAggregator::spawn(&config, Arc::clone(&sink) as Arc<dyn ResultSink>);
        (sink, handle, task)
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_size_threshold_flushes_exactly_once() {
        let (sink, handle, task) = spawn(50, Duration::from_secs(3600));

        for i in 0..50 {
            handle
                .plugin_result(Category::Polling, None, polling(ResultStatus::Success, i))
                .await;
        }
        wait_for(|| !sink.flush_sizes().is_empty()).await;
        assert_eq!(sink.flush_sizes(), vec![50]);

        // Buffer is empty: an explicit flush writes nothing.
        handle.flush().await;
        assert_eq!(sink.flush_sizes(), vec![50]);

        handle.shutdown().await;
        task.await.unwrap();
        assert_eq!(sink.flush_sizes(), vec![50]);
    }

    #[tokio::test]
    async fn test_time_threshold_flushes_partial_batch() {
        let (sink, handle, task) = spawn(50, Duration::from_millis(100));

        for i in 0..7 {
            handle
                .plugin_result(Category::Polling, None, polling(ResultStatus::Success, i))
                .await;
        }
        assert!(sink.flush_sizes().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(sink.flush_sizes(), vec![7]);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_polling_results_are_dropped() {
        let (sink, handle, task) = spawn(50, Duration::from_secs(3600));

        handle
            .plugin_result(Category::Polling, None, polling(ResultStatus::Failure, 1))
            .await;
        handle
            .plugin_result(Category::Polling, None, polling(ResultStatus::Success, 2))
            .await;
        handle.flush().await;

        let flushes = sink.flushes.lock().unwrap().clone();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].len(), 1);
        assert_eq!(flushes[0][0].provision_id, 2);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffer() {
        let (sink, handle, task) = spawn(50, Duration::from_secs(3600));

        for i in 0..3 {
            handle
                .plugin_result(Category::Polling, None, polling(ResultStatus::Success, i))
                .await;
        }
        handle.shutdown().await;
        task.await.unwrap();

        assert_eq!(sink.flush_sizes(), vec![3]);
    }

    #[tokio::test]
    async fn test_discovery_results_and_completion() {
        let (sink, handle, task) = spawn(50, Duration::from_secs(3600));

        let ok = PluginResult {
            status: ResultStatus::Success,
            address: "10.0.0.5".into(),
            port: Some(22),
            credential_profile_id: Some(4),
            provision_id: None,
            metric_type: vec![],
            data: Some(serde_json::json!({"hostname": "web-1"})),
            error: None,
        };
        handle
            .plugin_result(Category::Discovery, Some(9), ok)
            .await;
        let denied = PluginResult {
            status: ResultStatus::Failure,
            address: "10.0.0.6".into(),
            port: None,
            credential_profile_id: Some(4),
            provision_id: None,
            metric_type: vec![],
            data: None,
            error: Some("authentication failed".into()),
        };
        handle
            .plugin_result(Category::Discovery, Some(9), denied)
            .await;
        handle
            .invocation_complete(PluginRequest::discovery(9, vec![]))
            .await;
        handle.event(Event::system("test", EventSeverity::Debug, "hello", serde_json::json!({})));
        handle.flush().await;

        let discovery = sink.discovery.lock().unwrap().clone();
        assert_eq!(discovery.len(), 2);
        assert_eq!(discovery[0].result, DiscoveryOutcome::Completed);
        assert_eq!(discovery[0].credential_profile_id, Some(4));
        assert_eq!(discovery[1].result, DiscoveryOutcome::Failed);
        assert_eq!(discovery[1].port, 22);
        assert_eq!(discovery[1].msg.as_deref(), Some("authentication failed"));

        assert_eq!(
            sink.statuses.lock().unwrap().clone(),
            vec![(9, DiscoveryStatus::Completed)]
        );
        assert!(sink.flush_sizes().is_empty());
        assert_eq!(sink.events.lock().unwrap().len(), 2);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_polling_completion_does_not_touch_status() {
        let (sink, handle, task) = spawn(50, Duration::from_secs(3600));
        handle
            .invocation_complete(PluginRequest::polling(vec![]))
            .await;
        handle.flush().await;
        assert!(sink.statuses.lock().unwrap().is_empty());

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_events_counter() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = AggregatorHandle::from_sender(tx);

        let event = || Event::system("test", EventSeverity::Info, "x", serde_json::json!({}));
        handle.event(event());
        assert_eq!(handle.dropped_events(), 0);
        handle.event(event());
        assert_eq!(handle.dropped_events(), 1);
    }
}
