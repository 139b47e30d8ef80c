//! Execution Sandbox
//!
//! Runs a single plugin invocation under a wall-clock deadline and a memory ceiling while a
//! background task samples process memory and CPU at a fixed interval.
//!
//! Three futures are raced for every call: the plugin task, the sampler's violation signal and
//! the deadline. Whichever resolves first decides the status. The losers are cancelled and
//! joined before the result is returned, so no sampler or plugin task outlives the call.

pub mod execution_log;
pub mod metrics;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::plugin::{Plugin, PluginError, PluginInput, PluginResult};

pub use execution_log::{ExecutionLog, ExecutionLogRecord};
pub use metrics::{
    ExecutionMetadata, ExecutionMetrics, ExecutionResult, ExecutionStatus, FailureKind, InputSummary,
};

/// Sandbox limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock deadline per execution
    pub timeout: Duration,
    /// Ceiling on memory growth above the pre-call baseline, in MB
    pub memory_limit_mb: f64,
    /// Resource sampling period
    pub sample_interval: Duration,
    /// Where per-execution records are written; `None` disables the log
    pub execution_log_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_limit_mb: 512.0,
            sample_interval: Duration::from_millis(100),
            execution_log_dir: Some(default_execution_log_dir()),
        }
    }
}

impl SandboxConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_memory_limit_mb(mut self, limit: f64) -> Self {
        self.memory_limit_mb = limit;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    pub fn with_execution_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.execution_log_dir = dir;
        self
    }

    pub fn validate(&self) -> PluginResult<()> {
        if self.timeout.is_zero() {
            return Err(PluginError::configuration_error("sandbox timeout must be greater than zero"));
        }
        if !(self.memory_limit_mb > 0.0) {
            return Err(PluginError::configuration_error(format!(
                "sandbox memory limit must be positive, got {}", self.memory_limit_mb
            )));
        }
        if self.sample_interval.is_zero() {
            return Err(PluginError::configuration_error("sandbox sample interval must be greater than zero"));
        }
        if self.sample_interval > self.timeout {
            return Err(PluginError::configuration_error(format!(
                "sample interval {:?} exceeds timeout {:?}", self.sample_interval, self.timeout
            )));
        }
        Ok(())
    }
}

/// `<cache dir>/plugin-runtime/executions`, or the temp dir when no cache dir exists
pub fn default_execution_log_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("plugin-runtime")
        .join("executions")
}

/// One resource reading for the current process
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

/// Source of resource readings
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Samples the current process through `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
    pid: Option<sysinfo::Pid>,
    cpu_count: f64,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Resource sampling unavailable: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(sysinfo::System::new()),
            pid,
            cpu_count: num_cpus::get().max(1) as f64,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceSample {
        let Some(pid) = self.pid else {
            return ResourceSample::default();
        };

        let mut system = self.system.lock();
        system.refresh_process(pid);
        match system.process(pid) {
            Some(process) => ResourceSample {
                memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
                // sysinfo reports per-core percentages summed across cores
                cpu_percent: process.cpu_usage() as f64 / self.cpu_count,
            },
            None => ResourceSample::default(),
        }
    }
}

/// Execution counters
#[derive(Debug, Default)]
pub struct SandboxStats {
    executions: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    memory_violations: AtomicU64,
}

/// Point-in-time copy of [`SandboxStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatsSnapshot {
    pub executions: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub memory_violations: u64,
}

impl SandboxStats {
    fn record(&self, result: &ExecutionResult) {
        let counter = match result.status {
            ExecutionStatus::Success => &self.successes,
            ExecutionStatus::Timeout => &self.timeouts,
            ExecutionStatus::Error | ExecutionStatus::Running => &self.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if result.failure_kind == Some(FailureKind::ResourceLimit) {
            self.memory_violations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> SandboxStatsSnapshot {
        SandboxStatsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            memory_violations: self.memory_violations.load(Ordering::Relaxed),
        }
    }
}

/// Keeps the live sampler count accurate however the sampler task ends
struct SamplerGuard(Arc<AtomicUsize>);

impl SamplerGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for SamplerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Outcome {
    Finished(Result<PluginResult<Value>, tokio::task::JoinError>),
    MemoryExceeded(f64),
    TimedOut,
}

/// Runs plugin calls under a deadline and a memory ceiling
pub struct ExecutionSandbox {
    config: SandboxConfig,
    probe: Arc<dyn ResourceProbe>,
    stats: SandboxStats,
    active_samplers: Arc<AtomicUsize>,
    execution_log: ExecutionLog,
}

impl ExecutionSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(config: SandboxConfig, probe: Arc<dyn ResourceProbe>) -> Self {
        let execution_log = ExecutionLog::new(config.execution_log_dir.clone());
        Self {
            config,
            probe,
            stats: SandboxStats::default(),
            active_samplers: Arc::new(AtomicUsize::new(0)),
            execution_log,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn stats(&self) -> SandboxStatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of sampler tasks currently alive
    pub fn active_samplers(&self) -> usize {
        self.active_samplers.load(Ordering::SeqCst)
    }

    pub fn execution_log(&self) -> &ExecutionLog {
        &self.execution_log
    }

    /// Execute `plugin` against `input`, returning a structured result for every outcome.
    ///
    /// `timeout` overrides the configured deadline for this call only.
    pub async fn execute_with_monitoring(
        &self,
        plugin_id: &str,
        plugin: Arc<dyn Plugin>,
        input: PluginInput,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        let timeout = timeout.unwrap_or(self.config.timeout);
        let metadata = ExecutionMetadata {
            plugin_id: plugin_id.to_string(),
            execution_id: Uuid::new_v4(),
            input: InputSummary::from_input(&input),
            start_time: Utc::now(),
        };
        self.stats.executions.fetch_add(1, Ordering::Relaxed);
        debug!("Executing plugin '{}' ({}) with timeout {:?}", plugin_id, metadata.execution_id, timeout);

        let started = Instant::now();
        let metrics = ExecutionMetrics::start(metadata.start_time);

        let result = if let Err(e) = plugin.validate(&input) {
            let metrics = metrics.finalize(Utc::now(), started.elapsed(), ExecutionStatus::Error, Some(e.to_string()));
            ExecutionResult::from_metrics(metrics, metadata, None, Some(FailureKind::InvalidInput))
        } else {
            self.run_monitored(plugin, input, timeout, metrics, metadata, started).await
        };

        self.stats.record(&result);
        match result.status {
            ExecutionStatus::Success => debug!(
                "Plugin '{}' succeeded in {:?} (peak {:.1} MB, cpu {:.1}%)",
                plugin_id, result.duration, result.memory_usage, result.cpu_usage
            ),
            _ => info!(
                "Plugin '{}' finished with status {}: {}",
                plugin_id, result.status, result.error.as_deref().unwrap_or("")
            ),
        }

        self.execution_log.write(&result).await;
        result
    }

    async fn run_monitored(
        &self,
        plugin: Arc<dyn Plugin>,
        input: PluginInput,
        timeout: Duration,
        metrics: ExecutionMetrics,
        metadata: ExecutionMetadata,
        started: Instant,
    ) -> ExecutionResult {
        let baseline = self.probe.sample().memory_mb;
        let metrics = Arc::new(Mutex::new(metrics));
        let cancel = CancellationToken::new();
        let (violation_tx, mut violation_rx) = oneshot::channel();

        let sampler = self.spawn_sampler(baseline, metrics.clone(), cancel.clone(), violation_tx);
        let mut call = tokio::spawn(async move { plugin.execute(input).await });

        let outcome = tokio::select! {
            joined = &mut call => Outcome::Finished(joined),
            Ok(used) = &mut violation_rx => Outcome::MemoryExceeded(used),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
        };

        if !matches!(outcome, Outcome::Finished(_)) {
            call.abort();
            // Join so the plugin future is dropped before we report
            let _ = call.await;
        }
        cancel.cancel();
        if let Err(e) = sampler.await {
            warn!("Resource sampler for '{}' ended abnormally: {}", metadata.plugin_id, e);
        }

        let elapsed = started.elapsed();
        let end_time = Utc::now();
        let metrics = std::mem::replace(&mut *metrics.lock(), ExecutionMetrics::start(metadata.start_time));

        let (status, output, error, kind) = match outcome {
            Outcome::Finished(Ok(Ok(value))) => (ExecutionStatus::Success, Some(value), None, None),
            Outcome::Finished(Ok(Err(e))) => {
                let kind = match e {
                    PluginError::InvalidInput { .. } => FailureKind::InvalidInput,
                    PluginError::ResourceLimitExceeded { .. } => FailureKind::ResourceLimit,
                    _ => FailureKind::Plugin,
                };
                (ExecutionStatus::Error, None, Some(e.to_string()), Some(kind))
            }
            Outcome::Finished(Err(join_error)) => {
                let kind = if join_error.is_panic() { FailureKind::Panic } else { FailureKind::Plugin };
                (ExecutionStatus::Error, None, Some(PluginError::from(join_error).to_string()), Some(kind))
            }
            Outcome::MemoryExceeded(used) => {
                let error = PluginError::resource_limit_exceeded(format!(
                    "memory usage {:.1} MB exceeds limit of {:.1} MB", used, self.config.memory_limit_mb
                ));
                (ExecutionStatus::Error, None, Some(error.to_string()), Some(FailureKind::ResourceLimit))
            }
            Outcome::TimedOut => {
                let error = PluginError::timeout(format!(
                    "execution exceeded timeout of {:.3}s", timeout.as_secs_f64()
                ));
                (ExecutionStatus::Timeout, None, Some(error.to_string()), Some(FailureKind::Timeout))
            }
        };

        let metrics = metrics.finalize(end_time, elapsed, status, error);
        ExecutionResult::from_metrics(metrics, metadata, output, kind)
    }

    fn spawn_sampler(
        &self,
        baseline: f64,
        metrics: Arc<Mutex<ExecutionMetrics>>,
        cancel: CancellationToken,
        violation_tx: oneshot::Sender<f64>,
    ) -> JoinHandle<()> {
        let guard = SamplerGuard::new(self.active_samplers.clone());
        let probe = self.probe.clone();
        let interval = self.config.sample_interval;
        let limit = self.config.memory_limit_mb;

        tokio::spawn(async move {
            let _guard = guard;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut violation_tx = Some(violation_tx);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = probe.sample();
                        let used = (sample.memory_mb - baseline).max(0.0);
                        metrics.lock().record_sample(used, sample.cpu_percent);

                        if used > limit {
                            if let Some(tx) = violation_tx.take() {
                                let _ = tx.send(used);
                            }
                            break;
                        }
                    }
                }
            }
        })
    }
}
