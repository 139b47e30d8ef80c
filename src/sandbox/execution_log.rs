//! Per-invocation execution log
//!
//! Every execution is written as one JSON document named
//! `<plugin>_<timestamp>_<execution id>.json`. Write failures are logged and swallowed.

use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use super::metrics::{ExecutionResult, ExecutionStatus, FailureKind, InputSummary};

/// The audit record persisted for one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogRecord {
    pub execution_id: Uuid,
    pub plugin_id: String,
    pub status: ExecutionStatus,
    pub failure_kind: Option<FailureKind>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: u128,
    pub peak_memory_mb: f64,
    pub avg_cpu_percent: f64,
    pub cpu_sample_count: usize,
    pub error: Option<String>,
    pub input: InputSummary,
}

impl From<&ExecutionResult> for ExecutionLogRecord {
    fn from(result: &ExecutionResult) -> Self {
        Self {
            execution_id: result.execution_id,
            plugin_id: result.metadata.plugin_id.clone(),
            status: result.status,
            failure_kind: result.failure_kind,
            start_time: result.metrics.start_time,
            end_time: result.metrics.end_time,
            duration_ms: result.duration.as_millis(),
            peak_memory_mb: result.memory_usage,
            avg_cpu_percent: result.cpu_usage,
            cpu_sample_count: result.metrics.cpu_samples.len(),
            error: result.error.clone(),
            input: result.metadata.input.clone(),
        }
    }
}

/// Directory-backed execution log
#[derive(Debug, Clone)]
pub struct ExecutionLog {
    dir: Option<PathBuf>,
}

impl ExecutionLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// A log that records nothing
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// File name for a result
    pub fn file_name(result: &ExecutionResult) -> String {
        let plugin: String = result.metadata.plugin_id.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        format!(
            "{}_{}_{}.json",
            plugin,
            result.metrics.start_time.format("%Y%m%dT%H%M%S%3fZ"),
            result.execution_id,
        )
    }

    /// Persist the record for `result`, returning the written path
    pub async fn write(&self, result: &ExecutionResult) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let path = dir.join(Self::file_name(result));
        match Self::write_record(dir, &path, &ExecutionLogRecord::from(result)).await {
            Ok(()) => {
                debug!("Wrote execution log {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to write execution log for plugin '{}': {}", result.metadata.plugin_id, e);
                None
            }
        }
    }

    async fn write_record(dir: &Path, path: &Path, record: &ExecutionLogRecord) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let json = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(path, json).await
    }

    /// Read a record back
    pub async fn read(path: &Path) -> std::io::Result<ExecutionLogRecord> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
