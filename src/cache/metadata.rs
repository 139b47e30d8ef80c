//! Version metadata and the persisted cache document

use std::collections::{BTreeMap, BTreeSet};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of the test run that accompanied a cached version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub passed: u32,
    pub total: u32,
    /// Free-form detail from the test harness
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl TestResults {
    pub fn new(passed: u32, total: u32) -> Self {
        Self { passed, total, details: Value::Null }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// `passed / total`, or 0 when nothing ran
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.passed.min(self.total) as f64) / (self.total as f64)
        }
    }
}

/// Metadata for one cached plugin version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginVersionMetadata {
    /// Plugin name without the version suffix
    pub name: String,
    /// Versioned name, `<name>_v<N>`
    pub version: String,
    pub version_number: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub success_rate: f64,
    pub test_results: TestResults,
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub description: String,
    /// Bytes copied into the version directory
    #[serde(default)]
    pub size_bytes: u64,
}

impl PluginVersionMetadata {
    pub fn set_test_results(&mut self, results: TestResults) {
        self.success_rate = results.success_rate();
        self.test_results = results;
    }
}

/// The JSON document stored as `metadata.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    /// Highest version number ever assigned per name; numbers are never reused
    #[serde(default)]
    pub last_assigned: BTreeMap<String, u64>,
    #[serde(default)]
    pub versions: BTreeMap<String, PluginVersionMetadata>,
}

impl CacheDocument {
    /// Reserve the next version number for `name`
    pub fn next_version(&mut self, name: &str) -> u64 {
        let present = self.versions.values()
            .filter(|m| m.name == name)
            .map(|m| m.version_number)
            .max()
            .unwrap_or(0);
        let last = self.last_assigned.entry(name.to_string()).or_insert(0);
        *last = (*last).max(present) + 1;
        *last
    }

    pub fn versions_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a PluginVersionMetadata> + 'a {
        self.versions.values().filter(move |m| m.name == name)
    }
}
