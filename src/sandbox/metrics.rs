//! Execution metrics and results

use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use crate::plugin::PluginInput;

/// Terminal (or in-flight) status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Why a non-successful execution failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The plugin returned an error
    Plugin,
    /// The plugin rejected its input
    InvalidInput,
    /// The plugin task panicked
    Panic,
    /// Sampled memory exceeded the configured ceiling
    ResourceLimit,
    /// The wall-clock deadline passed
    Timeout,
    /// The plugin was unknown or not running
    NotRunnable,
}

/// Resource and timing record for a single execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub peak_memory_mb: f64,
    pub avg_cpu_percent: f64,
    pub cpu_samples: Vec<f64>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

impl ExecutionMetrics {
    pub fn start(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            duration: Duration::ZERO,
            peak_memory_mb: 0.0,
            avg_cpu_percent: 0.0,
            cpu_samples: Vec::new(),
            status: ExecutionStatus::Running,
            error: None,
        }
    }

    /// Record one sample; `memory_mb` is usage above the pre-call baseline
    pub fn record_sample(&mut self, memory_mb: f64, cpu_percent: f64) {
        if memory_mb > self.peak_memory_mb {
            self.peak_memory_mb = memory_mb;
        }
        self.cpu_samples.push(cpu_percent);
    }

    /// Close the record. Consumes the in-flight metrics so a finalized record is never touched again.
    pub fn finalize(
        mut self,
        end_time: DateTime<Utc>,
        duration: Duration,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Self {
        self.end_time = Some(end_time);
        self.duration = duration;
        self.status = status;
        self.error = error;
        self.avg_cpu_percent = if self.cpu_samples.is_empty() {
            0.0
        } else {
            self.cpu_samples.iter().sum::<f64>() / self.cpu_samples.len() as f64
        };
        self
    }
}

/// Shape of the input a plugin was called with; values are not echoed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSummary {
    pub keys: Vec<String>,
    pub size_bytes: usize,
}

impl InputSummary {
    pub fn from_input(input: &PluginInput) -> Self {
        let mut keys: Vec<String> = input.keys().cloned().collect();
        keys.sort();
        let size_bytes = serde_json::to_vec(input).map(|v| v.len()).unwrap_or(0);
        Self { keys, size_bytes }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub plugin_id: String,
    pub execution_id: Uuid,
    pub input: InputSummary,
    pub start_time: DateTime<Utc>,
}

/// The structured outcome of every execution, whatever happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub duration: Duration,
    /// Peak memory above the pre-call baseline, in MB
    pub memory_usage: f64,
    /// Mean sampled CPU percentage
    pub cpu_usage: f64,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub metadata: ExecutionMetadata,
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    pub fn from_metrics(
        metrics: ExecutionMetrics,
        metadata: ExecutionMetadata,
        output: Option<Value>,
        failure_kind: Option<FailureKind>,
    ) -> Self {
        Self {
            execution_id: metadata.execution_id,
            status: metrics.status,
            output: if metrics.status.is_success() { output } else { None },
            duration: metrics.duration,
            memory_usage: metrics.peak_memory_mb,
            cpu_usage: metrics.avg_cpu_percent,
            error: if metrics.status.is_success() { None } else { metrics.error.clone() },
            failure_kind: if metrics.status.is_success() { None } else { failure_kind },
            metadata,
            metrics,
        }
    }

    /// A result for a call that never reached the sandbox
    pub fn not_runnable(plugin_id: &str, input: &PluginInput, message: String) -> Self {
        let now = Utc::now();
        let metrics = ExecutionMetrics::start(now)
            .finalize(now, Duration::ZERO, ExecutionStatus::Error, Some(message));
        let metadata = ExecutionMetadata {
            plugin_id: plugin_id.to_string(),
            execution_id: Uuid::new_v4(),
            input: InputSummary::from_input(input),
            start_time: now,
        };
        Self::from_metrics(metrics, metadata, None, Some(FailureKind::NotRunnable))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn plugin_id(&self) -> &str {
        &self.metadata.plugin_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_finalize_averages_cpu() {
        let mut metrics = ExecutionMetrics::start(Utc::now());
        metrics.record_sample(10.0, 20.0);
        metrics.record_sample(30.0, 40.0);
        metrics.record_sample(5.0, 60.0);

        let metrics = metrics.finalize(Utc::now(), Duration::from_millis(250), ExecutionStatus::Success, None);
        assert_eq!(metrics.peak_memory_mb, 30.0);
        assert!((metrics.avg_cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(metrics.duration, Duration::from_millis(250));
        assert!(metrics.end_time.is_some());
    }

    #[test]
    fn test_no_samples_means_zero_cpu() {
        let metrics = ExecutionMetrics::start(Utc::now())
            .finalize(Utc::now(), Duration::ZERO, ExecutionStatus::Error, Some("x".into()));
        assert_eq!(metrics.avg_cpu_percent, 0.0);
        assert!(metrics.cpu_samples.is_empty());
    }

    #[test]
    fn test_not_runnable_result() {
        let mut input = PluginInput::new();
        input.insert("b".into(), json!(1));
        input.insert("a".into(), json!("text"));

        let result = ExecutionResult::not_runnable("ghost", &input, "Plugin not found: ghost".into());
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.failure_kind, Some(FailureKind::NotRunnable));
        assert!(result.output.is_none());
        assert_eq!(result.plugin_id(), "ghost");
        assert_eq!(result.metadata.input.keys, vec!["a", "b"]);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ExecutionStatus::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(serde_json::to_string(&FailureKind::ResourceLimit).unwrap(), "\"resource_limit\"");
    }
}
