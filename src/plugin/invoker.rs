//! Plugin process invocation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::aggregator::AggregatorHandle;
use crate::model::ProvisionId;
use crate::plugin::{Category, Dispatch, PluginError, PluginRequest, PluginResult};
use crate::storage::{Event, EventKind, EventSeverity};

/// Default bound on process exit once stdout has closed (2 minutes).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default guard on the output stream of one invocation (10 minutes).
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of concurrently running plugin processes.
const DEFAULT_WORKERS: usize = 8;

/// Default number of polling requests allowed to wait for a worker.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Upper bound on captured stderr kept for diagnostics.
const STDERR_LIMIT: u64 = 64 * 1024;

/// How long to wait for the stderr reader after the process is gone.
const STDERR_GRACE: Duration = Duration::from_secs(1);

/// Static event source tag for plugin events.
const PLUGIN_EVENT_SOURCE: &str = "plugin.invoker";

fn default_path() -> PathBuf {
    PathBuf::from("plugins/collector")
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_read_timeout() -> Duration {
    DEFAULT_READ_TIMEOUT
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Plugin executable settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Path of the collection executable.
    #[serde(default = "default_path")]
    pub path: PathBuf,
    /// Extra arguments (none by default).
    #[serde(default)]
    pub args: Vec<String>,
    /// Bound on process exit after stdout closed (default: 2m).
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Guard on reading the whole output stream (default: 10m).
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Maximum concurrently running plugin processes (default: 8).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Polling requests accepted while waiting for a worker (default: 256).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl PluginConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the exit timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the output stream guard.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Set the worker limit.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the polling backlog limit.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }
}

/// How a plugin process ended.
#[derive(Debug)]
pub enum InvocationExit {
    /// Process exited on its own.
    Exited(ExitStatus),
    /// A bound expired and the process was killed. Names the phase.
    TimedOut(&'static str),
    /// Process could not be started or its output could not be read.
    Failed(String),
}

/// Summary of one plugin invocation.
#[derive(Debug)]
pub struct Invocation {
    /// Results decoded from the plugin output.
    pub produced: usize,
    /// Failure results synthesized because the plugin produced nothing.
    pub synthesized: usize,
    /// Lines that could not be decoded.
    pub skipped: usize,
    pub exit: InvocationExit,
    pub duration: Duration,
}

impl Invocation {
    /// Reason to report when the invocation yielded no results, if it failed.
    fn failure_reason(&self, stderr: &str) -> Option<String> {
        let reason = match &self.exit {
            InvocationExit::Exited(status) if status.success() => return None,
            InvocationExit::Exited(status) => format!("plugin exited with {status}"),
            InvocationExit::TimedOut(phase) => {
                format!("plugin timed out {phase} after {}ms", self.duration.as_millis())
            }
            InvocationExit::Failed(msg) => msg.clone(),
        };
        let stderr = stderr.trim();
        if stderr.is_empty() {
            Some(reason)
        } else {
            Some(format!("{reason}: {}", tail(stderr, 512)))
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Requests accepted by `submit` that have not finished yet.
#[derive(Debug, Default)]
struct Backlog {
    pending: usize,
    /// Provisions with a polling request queued or running.
    devices: HashSet<ProvisionId>,
}

/// Releases a backlog entry when the invocation task ends, however it ends.
struct BacklogSlot {
    backlog: Arc<Mutex<Backlog>>,
    devices: Vec<ProvisionId>,
}

impl Drop for BacklogSlot {
    fn drop(&mut self) {
        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        backlog.pending = backlog.pending.saturating_sub(1);
        for device in &self.devices {
            backlog.devices.remove(device);
        }
    }
}

/// Runs plugin processes and streams their results to the aggregator.
///
/// Cloning is cheap; clones share the worker limit and the backlog.
#[derive(Clone)]
pub struct PluginInvoker {
    config: Arc<PluginConfig>,
    permits: Arc<Semaphore>,
    backlog: Arc<Mutex<Backlog>>,
    dropped: Arc<AtomicU64>,
    coalesced: Arc<AtomicU64>,
    output: AggregatorHandle,
}

impl std::fmt::Debug for PluginInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInvoker")
            .field("path", &self.config.path)
            .field("available_workers", &self.permits.available_permits())
            .field("backlog", &self.backlog())
            .finish_non_exhaustive()
    }
}

impl PluginInvoker {
    pub fn new(config: PluginConfig, output: AggregatorHandle) -> Self {
        let workers = config.workers.max(1);
        Self {
            config: Arc::new(config),
            permits: Arc::new(Semaphore::new(workers)),
            backlog: Arc::new(Mutex::new(Backlog::default())),
            dropped: Arc::new(AtomicU64::new(0)),
            coalesced: Arc::new(AtomicU64::new(0)),
            output,
        }
    }

    /// Submitted requests not yet finished (queued plus running).
    pub fn backlog(&self) -> usize {
        self.backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
    }

    /// Polling requests rejected because the backlog was full.
    pub fn dropped_requests(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Polling requests skipped because the device was still being polled.
    pub fn coalesced_ticks(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Run one request to completion.
    ///
    /// Every decoded result is forwarded as soon as it is read. Exactly one
    /// invocation-complete signal is emitted, whatever the outcome.
    pub async fn invoke(&self, request: PluginRequest) -> Invocation {
        let _permit = Arc::clone(&self.permits).acquire_owned().await;
        let started = Instant::now();
        tracing::debug!(
            plugin = %self.config.path.display(),
            category = %request.category,
            targets = request.targets.len(),
            "Starting plugin"
        );

        let (mut invocation, stderr) = match self.run(&request).await {
            Ok(run) => run,
            Err(e) => (
                Invocation {
                    produced: 0,
                    synthesized: 0,
                    skipped: 0,
                    exit: InvocationExit::Failed(e.to_string()),
                    duration: Duration::ZERO,
                },
                String::new(),
            ),
        };
        invocation.duration = started.elapsed();

        if invocation.produced == 0
            && let Some(reason) = invocation.failure_reason(&stderr)
        {
            self.report_failure(&request, &reason).await;
            invocation.synthesized = usize::from(!request.targets.is_empty());
        } else if !stderr.trim().is_empty() {
            tracing::debug!(
                plugin = %self.config.path.display(),
                stderr = %tail(stderr.trim(), 2048),
                "Plugin diagnostics"
            );
        }

        tracing::debug!(
            category = %request.category,
            produced = invocation.produced,
            synthesized = invocation.synthesized,
            skipped = invocation.skipped,
            duration_ms = invocation.duration.as_millis(),
            "Plugin invocation complete"
        );
        self.output.invocation_complete(request).await;
        invocation
    }

    /// Emit the single synthesized failure for an invocation that produced
    /// nothing. It is correlated with the first target.
    async fn report_failure(&self, request: &PluginRequest, reason: &str) {
        let targets = request.targets.len();
        tracing::warn!(
            plugin = %self.config.path.display(),
            category = %request.category,
            targets,
            error = %reason,
            "Plugin produced no results"
        );
        self.output.event(
            Event::system(
                PLUGIN_EVENT_SOURCE,
                EventSeverity::Error,
                format!("Plugin produced no results for {targets} target(s)"),
                json!({
                    "category": request.category.as_ref(),
                    "discovery_id": request.discovery_id,
                    "targets": targets,
                    "error": reason,
                }),
            )
            .with_kind(EventKind::Error),
        );

        let Some(first) = request.targets.first() else {
            return;
        };
        let message = if targets > 1 {
            format!("{reason} (no results for {targets} targets)")
        } else {
            reason.to_string()
        };
        let result = PluginResult::failure_for(first, message);
        self.output
            .plugin_result(request.category, request.discovery_id, result)
            .await;
    }

    /// Spawn the process and pump its streams.
    ///
    /// The child is spawned with `kill_on_drop`, so an early return or panic
    /// anywhere below tears the process down together with its pipes. The
    /// request is written from its own task while stdout is read, so a plugin
    /// that never drains stdin cannot hold the invocation past its bounds.
    async fn run(&self, request: &PluginRequest) -> Result<(Invocation, String), PluginError> {
        let line = request.encode()?;

        let mut child = Command::new(&self.config.path)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PluginError::Spawn)?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Io(std::io::Error::other("plugin stdout not captured")))?;
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr {
                let _ = stderr.take(STDERR_LIMIT).read_to_string(&mut buf).await;
            }
            buf
        });
        let writer = stdin.map(|stdin| tokio::spawn(write_request(stdin, line)));

        let mut produced = 0usize;
        let mut skipped = 0usize;
        let streamed = timeout(self.config.read_timeout, async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match PluginResult::decode(&line) {
                    Ok(mut result) => {
                        if result.port.is_none() {
                            result.port = request
                                .targets
                                .iter()
                                .find(|t| t.address == result.address)
                                .map(|t| t.port);
                        }
                        produced += 1;
                        self.output
                            .plugin_result(request.category, request.discovery_id, result)
                            .await;
                    }
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(
                            plugin = %self.config.path.display(),
                            error = %e,
                            "Skipping malformed plugin output line"
                        );
                    }
                }
            }
            Ok::<(), std::io::Error>(())
        })
        .await;

        let exit = match streamed {
            Ok(Ok(())) => match timeout(self.config.timeout, child.wait()).await {
                Ok(Ok(status)) => InvocationExit::Exited(status),
                Ok(Err(e)) => {
                    let _ = child.kill().await;
                    InvocationExit::Failed(format!("plugin wait failed: {e}"))
                }
                Err(_) => {
                    self.log_timeout("waiting for exit", self.config.timeout);
                    let _ = child.kill().await;
                    InvocationExit::TimedOut("waiting for exit")
                }
            },
            Ok(Err(e)) => {
                let _ = child.kill().await;
                InvocationExit::Failed(format!("plugin i/o error: {e}"))
            }
            Err(_) => {
                self.log_timeout("reading output", self.config.read_timeout);
                let _ = child.kill().await;
                InvocationExit::TimedOut("reading output")
            }
        };

        if let Some(writer) = writer {
            if writer.is_finished() {
                if let Ok(Err(e)) = writer.await {
                    // The plugin may have exited without reading; its output was still read.
                    tracing::warn!(plugin = %self.config.path.display(), error = %e, "Failed to write plugin request");
                }
            } else {
                writer.abort();
            }
        }

        let stderr = match timeout(STDERR_GRACE, stderr_task).await {
            Ok(Ok(buf)) => buf,
            _ => String::new(),
        };

        Ok((
            Invocation {
                produced,
                synthesized: 0,
                skipped,
                exit,
                duration: Duration::ZERO,
            },
            stderr,
        ))
    }

    fn log_timeout(&self, phase: &str, bound: Duration) {
        tracing::warn!(
            plugin = %self.config.path.display(),
            phase,
            timeout_ms = bound.as_millis(),
            "Plugin timed out, killing process"
        );
    }

    /// Reserve a backlog entry for `request`, or refuse it.
    ///
    /// Polling requests are refused while the same device is still queued or
    /// running, and when the backlog is full. Discovery requests are always
    /// accepted: the attempt only completes through its invocation.
    fn admit(&self, request: &PluginRequest) -> Option<BacklogSlot> {
        let devices: Vec<ProvisionId> = match request.category {
            Category::Polling => request.targets.iter().filter_map(|t| t.provision_id).collect(),
            Category::Discovery => Vec::new(),
        };

        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        if devices.iter().any(|d| backlog.devices.contains(d)) {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(?devices, "Device still being polled, skipping tick");
            return None;
        }
        if request.category == Category::Polling && backlog.pending >= self.config.queue_capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                pending = backlog.pending,
                capacity = self.config.queue_capacity,
                "Plugin backlog full, dropping polling request"
            );
            return None;
        }
        backlog.pending += 1;
        backlog.devices.extend(devices.iter().copied());
        Some(BacklogSlot {
            backlog: Arc::clone(&self.backlog),
            devices,
        })
    }
}

/// Write the request line and close stdin.
async fn write_request(mut stdin: ChildStdin, line: String) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    stdin.shutdown().await?;
    Ok(())
}

impl Dispatch for PluginInvoker {
    fn submit(&self, request: PluginRequest) {
        let Some(slot) = self.admit(&request) else {
            return;
        };
        let invoker = self.clone();
        tokio::spawn(async move {
            let _slot = slot;
            invoker.invoke(request).await;
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::aggregator::Command as AggregatorCommand;
    use crate::model::{Credential, DeviceTarget, SystemType};
    use crate::plugin::{PluginTarget, ResultStatus};
    use tokio::sync::mpsc;

    fn polling_request(provision_id: ProvisionId) -> PluginRequest {
        let target = DeviceTarget::new("10.0.0.5", 22).unwrap();
        let credential = Credential::new(1, "admin", "pw", SystemType::Linux);
        PluginRequest::polling(vec![PluginTarget::polling(
            provision_id,
            &target,
            &credential,
            vec!["cpu".into()],
        )])
    }

    fn request() -> PluginRequest {
        polling_request(4)
    }

    /// Discovery request with `hosts` targets, 10.0.0.1 upwards.
    fn discovery_request(hosts: u32) -> PluginRequest {
        let credential = Credential::new(9, "root", "pw", SystemType::Linux);
        let base = u32::from(std::net::Ipv4Addr::new(10, 0, 0, 0));
        let targets = (1..=hosts)
            .map(|i| {
                let address = std::net::Ipv4Addr::from(base + i);
                let target = DeviceTarget::new(address.to_string(), 22).unwrap();
                PluginTarget::discovery(&target, &credential)
            })
            .collect();
        PluginRequest::discovery(42, targets)
    }

    fn shell(script: impl Into<String>) -> PluginConfig {
        PluginConfig::new("/bin/sh").with_args(["-c".to_string(), script.into()])
    }

    fn invoker(config: PluginConfig) -> (PluginInvoker, mpsc::Receiver<AggregatorCommand>) {
        let (tx, rx) = mpsc::channel(64);
        (PluginInvoker::new(config, AggregatorHandle::from_sender(tx)), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<AggregatorCommand>) -> (Vec<PluginResult>, usize) {
        let mut results = Vec::new();
        let mut completions = 0;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                AggregatorCommand::Result { result, .. } => results.push(result),
                AggregatorCommand::InvocationComplete(_) => completions += 1,
                _ => {}
            }
        }
        (results, completions)
    }

    #[tokio::test]
    async fn test_streams_decoded_results() {
        let ok = PluginResult {
            status: ResultStatus::Success,
            address: "10.0.0.5".into(),
            port: Some(22),
            credential_profile_id: Some(1),
            provision_id: Some(4),
            metric_type: vec!["cpu".into()],
            data: Some(serde_json::json!({"cpu": 12.5})),
            error: None,
        }
        .encode()
        .unwrap();
        // Consume the request line, then emit one good line, one garbage line, one blank line.
        let script = format!("read _req; echo '{ok}'; echo 'not-base64!!'; echo ''");
        let (invoker, mut rx) = invoker(shell(script));

        let invocation = invoker.invoke(request()).await;
        assert_eq!(invocation.produced, 1);
        assert_eq!(invocation.skipped, 1);
        assert_eq!(invocation.synthesized, 0);
        assert!(matches!(invocation.exit, InvocationExit::Exited(s) if s.success()));

        let (results, completions) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert_eq!(results[0].data.as_ref().unwrap()["cpu"], 12.5);
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_plugin_receives_single_encoded_line() {
        // Echo the raw request line back as the error message.
        let script = r#"input=$(cat); printf '{"status":"failure","ip.address":"10.0.0.5","error":"%s"}' "$input" | base64 | tr -d '\n'; echo"#;
        let (invoker, mut rx) = invoker(shell(script));

        let req = request();
        invoker.invoke(req.clone()).await;
        let (results, _) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error.as_deref(), Some(req.encode().unwrap().as_str()));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_output_synthesizes_failure() {
        let (invoker, mut rx) = invoker(shell("echo 'ssh: connection refused' >&2; exit 3"));

        let invocation = invoker.invoke(request()).await;
        assert_eq!(invocation.produced, 0);
        assert_eq!(invocation.synthesized, 1);

        let (results, completions) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ResultStatus::Failure);
        assert_eq!(results[0].provision_id, Some(4));
        let msg = results[0].error.clone().unwrap();
        assert!(!msg.is_empty());
        assert!(msg.contains("connection refused"));
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_clean_exit_without_output_synthesizes_nothing() {
        let (invoker, mut rx) = invoker(shell("cat > /dev/null; exit 0"));

        let invocation = invoker.invoke(request()).await;
        assert_eq!(invocation.synthesized, 0);

        let (results, completions) = drain(&mut rx);
        assert!(results.is_empty());
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_multi_target_failure_synthesizes_one_result() {
        let (invoker, mut rx) = invoker(shell("cat > /dev/null; exit 3"));

        let invocation = invoker.invoke(discovery_request(3)).await;
        assert_eq!(invocation.produced, 0);
        assert_eq!(invocation.synthesized, 1);

        let (results, completions) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ResultStatus::Failure);
        assert_eq!(results[0].address, "10.0.0.1");
        assert_eq!(results[0].credential_profile_id, Some(9));
        assert!(results[0].error_message().contains("no results for 3 targets"));
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_as_event() {
        let (invoker, mut rx) = invoker(shell("cat > /dev/null; exit 1"));
        invoker.invoke(request()).await;

        let mut events = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let AggregatorCommand::Event(e) = cmd {
                events.push(e);
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, PLUGIN_EVENT_SOURCE);
        assert_eq!(events[0].kind, EventKind::Error);
    }

    #[tokio::test]
    async fn test_stuck_output_is_bounded_by_read_timeout() {
        let config = shell("exec sleep 10")
            .with_timeout(Duration::from_millis(200))
            .with_read_timeout(Duration::from_millis(200));
        let (invoker, mut rx) = invoker(config);

        let started = Instant::now();
        let invocation = invoker.invoke(request()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(invocation.exit, InvocationExit::TimedOut("reading output")));

        let (results, completions) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert!(results[0].error_message().contains("timed out"));
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_exit_wait_is_bounded_after_output_closes() {
        let config = shell("read _req; exec >&-; exec sleep 10")
            .with_timeout(Duration::from_millis(200));
        let (invoker, mut rx) = invoker(config);

        let started = Instant::now();
        let invocation = invoker.invoke(request()).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(invocation.exit, InvocationExit::TimedOut("waiting for exit")));

        let (results, completions) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert!(results[0].error_message().contains("waiting for exit"));
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_streaming_may_outlast_exit_timeout() {
        let ok = PluginResult::failure_for(&request().targets[0], "slow but alive")
            .encode()
            .unwrap();
        let config = shell(format!("read _req; sleep 0.5; echo '{ok}'"))
            .with_timeout(Duration::from_millis(200))
            .with_read_timeout(Duration::from_secs(5));
        let (invoker, mut rx) = invoker(config);

        let invocation = invoker.invoke(request()).await;
        assert_eq!(invocation.produced, 1);
        assert_eq!(invocation.synthesized, 0);
        assert!(matches!(invocation.exit, InvocationExit::Exited(s) if s.success()));

        let (results, _) = drain(&mut rx);
        assert_eq!(results[0].error_message(), "slow but alive");
    }

    #[tokio::test]
    async fn test_large_request_to_non_reading_plugin_is_bounded() {
        let config = shell("exec sleep 30")
            .with_timeout(Duration::from_millis(200))
            .with_read_timeout(Duration::from_millis(200));
        let (invoker, mut rx) = invoker(config);

        let req = discovery_request(2000);
        // Larger than any pipe buffer.
        assert!(req.encode().unwrap().len() > 64 * 1024);

        let invocation = tokio::time::timeout(Duration::from_secs(10), invoker.invoke(req))
            .await
            .expect("invocation must end within its bounds");
        assert!(matches!(invocation.exit, InvocationExit::TimedOut(_)));
        assert_eq!(invocation.synthesized, 1);

        let (results, completions) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert_eq!(completions, 1);
        assert_eq!(invoker.permits.available_permits(), DEFAULT_WORKERS);
    }

    #[tokio::test]
    async fn test_repeat_tick_for_busy_device_is_skipped() {
        let (invoker, mut rx) = invoker(shell("cat > /dev/null; sleep 0.3"));

        invoker.submit(request());
        invoker.submit(request());
        assert_eq!(invoker.coalesced_ticks(), 1);
        assert_eq!(invoker.backlog(), 1);

        // Another device is not affected.
        invoker.submit(polling_request(5));
        assert_eq!(invoker.backlog(), 2);

        let mut completions = 0;
        while completions < 2 {
            let cmd = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(cmd, AggregatorCommand::InvocationComplete(_)) {
                completions += 1;
            }
        }
        for _ in 0..100 {
            if invoker.backlog() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(invoker.backlog(), 0);

        // Once finished, the device is polled again.
        invoker.submit(request());
        assert_eq!(invoker.backlog(), 1);
        assert_eq!(invoker.coalesced_ticks(), 1);
    }

    #[tokio::test]
    async fn test_full_backlog_drops_polling_but_keeps_discovery() {
        let config = shell("cat > /dev/null; sleep 2")
            .with_workers(1)
            .with_queue_capacity(2);
        let (invoker, _rx) = invoker(config);

        invoker.submit(polling_request(1));
        invoker.submit(polling_request(2));
        invoker.submit(polling_request(3));
        assert_eq!(invoker.dropped_requests(), 1);
        assert_eq!(invoker.backlog(), 2);

        invoker.submit(discovery_request(1));
        assert_eq!(invoker.backlog(), 3);
        assert_eq!(invoker.dropped_requests(), 1);
    }

    #[tokio::test]
    async fn test_missing_executable_reports_failure() {
        let (invoker, mut rx) = invoker(PluginConfig::new("/nonexistent/netwatch-plugin"));

        let invocation = invoker.invoke(request()).await;
        assert!(matches!(invocation.exit, InvocationExit::Failed(_)));

        let (results, completions) = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert!(results[0].error_message().contains("failed to start plugin"));
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_discovery_completion_carries_request() {
        let target = DeviceTarget::new("10.0.0.5", 22).unwrap();
        let credential = Credential::new(9, "root", "pw", SystemType::Linux);
        let req = PluginRequest::discovery(42, vec![PluginTarget::discovery(&target, &credential)]);
        let (invoker, mut rx) = invoker(shell("cat > /dev/null"));

        invoker.invoke(req).await;
        let mut completed = None;
        while let Ok(cmd) = rx.try_recv() {
            if let AggregatorCommand::InvocationComplete(r) = cmd {
                completed = Some(r);
            }
        }
        let completed = completed.unwrap();
        assert_eq!(completed.category, Category::Discovery);
        assert_eq!(completed.discovery_id, Some(42));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abcdef", 3), "def");
        let s = "ééé";
        assert!(tail(s, 3).len() <= 3);
    }
}
