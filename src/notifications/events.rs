//! Notification Event Types
//!
//! Events emitted by the runtime for lifecycle changes, executions, adaptation and the
//! version cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use crate::lifecycle::StateTransition;
use crate::sandbox::ExecutionResult;
use crate::trust::AdaptationPlan;
use crate::cache::CleanupStats;

/// Base trait for all notification events
pub trait NotificationEvent: Send + Sync + Clone + std::fmt::Debug + 'static {}

/// Kinds of runtime event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeEventType {
    PluginRegistered,
    StateChanged,
    ExecutionStarted,
    ExecutionCompleted,
    AdaptationRequired,
    VersionCached,
    CacheCleaned,
}

/// An event published by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub event_type: RuntimeEventType,
    pub plugin_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent for RuntimeEvent {}

impl RuntimeEvent {
    pub fn new<S: Into<String>>(event_type: RuntimeEventType, plugin_id: S, payload: Value) -> Self {
        Self {
            event_type,
            plugin_id: plugin_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn plugin_registered(plugin_id: &str, version: &str, dependencies: &[String]) -> Self {
        Self::new(
            RuntimeEventType::PluginRegistered,
            plugin_id,
            json!({ "version": version, "dependencies": dependencies }),
        )
    }

    pub fn state_changed(plugin_id: &str, transition: &StateTransition) -> Self {
        Self::new(
            RuntimeEventType::StateChanged,
            plugin_id,
            json!({
                "from": transition.from,
                "to": transition.to,
                "event": transition.event,
                "error": transition.error,
            }),
        )
    }

    pub fn execution_started(plugin_id: &str, input_keys: &[String]) -> Self {
        Self::new(RuntimeEventType::ExecutionStarted, plugin_id, json!({ "input_keys": input_keys }))
    }

    pub fn execution_completed(result: &ExecutionResult) -> Self {
        Self::new(
            RuntimeEventType::ExecutionCompleted,
            result.plugin_id(),
            json!({
                "execution_id": result.execution_id,
                "status": result.status,
                "duration_ms": result.duration.as_millis() as u64,
                "memory_usage_mb": result.memory_usage,
                "cpu_usage_percent": result.cpu_usage,
                "error": result.error,
            }),
        )
    }

    pub fn adaptation_required(plugin_id: &str, score: f64, plan: &AdaptationPlan) -> Self {
        Self::new(
            RuntimeEventType::AdaptationRequired,
            plugin_id,
            json!({ "score": score, "plan": plan }),
        )
    }

    pub fn version_cached(name: &str, versioned: &str) -> Self {
        Self::new(RuntimeEventType::VersionCached, name, json!({ "version": versioned }))
    }

    pub fn cache_cleaned(name: &str, stats: &CleanupStats) -> Self {
        Self::new(RuntimeEventType::CacheCleaned, name, json!(stats))
    }
}
