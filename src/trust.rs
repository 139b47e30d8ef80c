//! Trust Ledger
//!
//! Keeps a decaying composite trust score per plugin identity. Every outcome moves the
//! reliability, performance and security components by configured deltas. Before any delta is
//! applied, all components decay by `decay_factor` per whole day since the last update.
//!
//! ```text
//! score = reliability * w_r + performance * w_p + security * w_s   clamped to [min, max]
//! ```

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::time::Duration;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::clock::{system_clock, SharedClock};
use crate::plugin::{PluginError, PluginResult};
use crate::sandbox::{ExecutionResult, ExecutionStatus, FailureKind};

/// Component deltas applied for one outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrustDelta {
    pub reliability: f64,
    pub performance: f64,
    pub security: f64,
}

impl TrustDelta {
    pub const fn new(reliability: f64, performance: f64, security: f64) -> Self {
        Self { reliability, performance, security }
    }

    pub fn is_zero(&self) -> bool {
        self.reliability == 0.0 && self.performance == 0.0 && self.security == 0.0
    }
}

/// Deltas per execution outcome
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutcomeDeltas {
    pub success: TrustDelta,
    pub error: TrustDelta,
    pub timeout: TrustDelta,
    pub memory_limit: TrustDelta,
}

impl Default for OutcomeDeltas {
    fn default() -> Self {
        Self {
            success: TrustDelta::new(0.02, 0.01, 0.0),
            error: TrustDelta::new(-0.1, 0.0, 0.0),
            timeout: TrustDelta::new(-0.05, -0.2, 0.0),
            memory_limit: TrustDelta::new(0.0, -0.1, -0.15),
        }
    }
}

/// Trust ledger parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TrustConfig {
    /// Per-day multiplicative decay
    pub decay_factor: f64,
    pub min_trust: f64,
    pub max_trust: f64,
    pub reliability_weight: f64,
    pub performance_weight: f64,
    pub security_weight: f64,
    /// History snapshots kept per plugin
    pub max_history: usize,
    /// Threshold used by adaptation rules that do not set their own
    pub adaptation_threshold: f64,
    pub outcome_deltas: OutcomeDeltas,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.95,
            min_trust: 0.1,
            max_trust: 1.0,
            reliability_weight: 0.4,
            performance_weight: 0.3,
            security_weight: 0.3,
            max_history: 100,
            adaptation_threshold: 0.5,
            outcome_deltas: OutcomeDeltas::default(),
        }
    }
}

impl TrustConfig {
    pub fn validate(&self) -> PluginResult<()> {
        if !(self.decay_factor > 0.0 && self.decay_factor <= 1.0) {
            return Err(PluginError::configuration_error(format!(
                "decay factor must be in (0, 1], got {}", self.decay_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.min_trust) || !(0.0..=1.0).contains(&self.max_trust) || self.min_trust > self.max_trust {
            return Err(PluginError::configuration_error(format!(
                "trust bounds must satisfy 0 <= min <= max <= 1, got [{}, {}]", self.min_trust, self.max_trust
            )));
        }
        let weights = [self.reliability_weight, self.performance_weight, self.security_weight];
        if weights.iter().any(|w| *w < 0.0) {
            return Err(PluginError::configuration_error("trust weights must not be negative"));
        }
        if (weights.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(PluginError::configuration_error(format!(
                "trust weights must sum to 1.0, got {}", weights.iter().sum::<f64>()
            )));
        }
        if self.max_history == 0 {
            return Err(PluginError::configuration_error("max history must be at least 1"));
        }
        Ok(())
    }
}

/// One point in a plugin's trust history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrustSnapshot {
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub reliability: f64,
    pub performance: f64,
    pub security: f64,
}

/// Composite trust score for one plugin identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub plugin_id: String,
    pub score: f64,
    pub reliability: f64,
    pub performance: f64,
    pub security: f64,
    pub last_updated: DateTime<Utc>,
    pub history: VecDeque<TrustSnapshot>,
    pub max_history_size: usize,
}

impl TrustScore {
    fn neutral(plugin_id: &str, now: DateTime<Utc>, max_history_size: usize) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            score: 1.0,
            reliability: 1.0,
            performance: 1.0,
            security: 1.0,
            last_updated: now,
            history: VecDeque::new(),
            max_history_size,
        }
    }

    fn apply(&mut self, config: &TrustConfig, delta: TrustDelta, now: DateTime<Utc>) {
        let days = (now - self.last_updated).num_days();
        if days > 0 {
            let decay = config.decay_factor.powi(days.min(i32::MAX as i64) as i32);
            self.score *= decay;
            self.reliability *= decay;
            self.performance *= decay;
            self.security *= decay;
        }

        self.reliability = (self.reliability + delta.reliability).clamp(0.0, 1.0);
        self.performance = (self.performance + delta.performance).clamp(0.0, 1.0);
        self.security = (self.security + delta.security).clamp(0.0, 1.0);

        let weighted = self.reliability * config.reliability_weight
            + self.performance * config.performance_weight
            + self.security * config.security_weight;
        self.score = weighted.clamp(config.min_trust, config.max_trust);
        self.last_updated = now;

        self.history.push_back(self.snapshot());
        while self.history.len() > self.max_history_size {
            self.history.pop_front();
        }
    }

    pub fn snapshot(&self) -> TrustSnapshot {
        TrustSnapshot {
            timestamp: self.last_updated,
            score: self.score,
            reliability: self.reliability,
            performance: self.performance,
            security: self.security,
        }
    }
}

/// What to do with a plugin whose trust has fallen too far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptationStrategy {
    Retry,
    Fallback,
    Disable,
}

/// Per-plugin adaptation policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationRule {
    pub strategy: AdaptationStrategy,
    pub parameters: Value,
    pub fallback_plugin: Option<String>,
    pub retry_count: u32,
    pub timeout: Option<Duration>,
    /// Falls back to the ledger's configured threshold when unset
    pub adaptation_threshold: Option<f64>,
}

impl AdaptationRule {
    pub fn new(strategy: AdaptationStrategy) -> Self {
        Self {
            strategy,
            parameters: Value::Null,
            fallback_plugin: None,
            retry_count: 0,
            timeout: None,
            adaptation_threshold: None,
        }
    }

    pub fn retry(retry_count: u32) -> Self {
        Self { retry_count, ..Self::new(AdaptationStrategy::Retry) }
    }

    pub fn fallback<S: Into<String>>(plugin: S) -> Self {
        Self { fallback_plugin: Some(plugin.into()), ..Self::new(AdaptationStrategy::Fallback) }
    }

    pub fn disable() -> Self {
        Self::new(AdaptationStrategy::Disable)
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.adaptation_threshold = Some(threshold);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// The adaptation a caller should perform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationPlan {
    pub strategy: AdaptationStrategy,
    pub parameters: Value,
    pub fallback_plugin: Option<String>,
    pub retry_count: u32,
    pub timeout: Option<Duration>,
}

impl From<&AdaptationRule> for AdaptationPlan {
    fn from(rule: &AdaptationRule) -> Self {
        Self {
            strategy: rule.strategy,
            parameters: rule.parameters.clone(),
            fallback_plugin: rule.fallback_plugin.clone(),
            retry_count: rule.retry_count,
            timeout: rule.timeout,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    saved_at: DateTime<Utc>,
    scores: Vec<TrustScore>,
}

/// Decaying per-plugin trust scores plus adaptation rules
pub struct TrustLedger {
    config: TrustConfig,
    scores: DashMap<String, TrustScore>,
    rules: DashMap<String, AdaptationRule>,
    clock: SharedClock,
}

impl Default for TrustLedger {
    fn default() -> Self {
        Self::new(TrustConfig::default(), system_clock())
    }
}

impl TrustLedger {
    pub fn new(config: TrustConfig, clock: SharedClock) -> Self {
        Self {
            config,
            scores: DashMap::new(),
            rules: DashMap::new(),
            clock,
        }
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Return the existing score, or create a neutral one
    pub fn register(&self, plugin_id: &str) -> TrustScore {
        self.scores.entry(plugin_id.to_string())
            .or_insert_with(|| {
                debug!("Registered trust score for '{}'", plugin_id);
                TrustScore::neutral(plugin_id, self.clock.now(), self.config.max_history)
            })
            .clone()
    }

    /// Decay, apply `delta`, and record a history snapshot.
    ///
    /// Unknown plugins are registered first. The shard lock serializes concurrent updates
    /// for one identity.
    pub fn update(&self, plugin_id: &str, delta: TrustDelta) -> TrustScore {
        let mut entry = self.scores.entry(plugin_id.to_string())
            .or_insert_with(|| TrustScore::neutral(plugin_id, self.clock.now(), self.config.max_history));
        entry.apply(&self.config, delta, self.clock.now());
        debug!("Trust for '{}' is now {:.3}", plugin_id, entry.score);
        entry.clone()
    }

    /// Map an execution outcome to its configured deltas and apply them.
    ///
    /// Calls that never ran (unknown or stopped plugin) leave the score untouched.
    pub fn record_outcome(&self, plugin_id: &str, result: &ExecutionResult) -> TrustScore {
        let deltas = &self.config.outcome_deltas;
        let delta = match (result.status, result.failure_kind) {
            (_, Some(FailureKind::NotRunnable)) => return self.register(plugin_id),
            (ExecutionStatus::Success, _) => deltas.success,
            (ExecutionStatus::Timeout, _) | (_, Some(FailureKind::Timeout)) => deltas.timeout,
            (_, Some(FailureKind::ResourceLimit)) => deltas.memory_limit,
            _ => deltas.error,
        };
        self.update(plugin_id, delta)
    }

    pub fn get_score(&self, plugin_id: &str) -> Option<TrustScore> {
        self.scores.get(plugin_id).map(|s| s.value().clone())
    }

    pub fn history(&self, plugin_id: &str) -> Vec<TrustSnapshot> {
        self.scores.get(plugin_id)
            .map(|s| s.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Return a plugin to neutral trust, dropping its history
    pub fn reset(&self, plugin_id: &str) -> TrustScore {
        let score = TrustScore::neutral(plugin_id, self.clock.now(), self.config.max_history);
        self.scores.insert(plugin_id.to_string(), score.clone());
        info!("Reset trust score for '{}'", plugin_id);
        score
    }

    pub fn remove(&self, plugin_id: &str) -> Option<TrustScore> {
        self.rules.remove(plugin_id);
        self.scores.remove(plugin_id).map(|(_, s)| s)
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scores.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn set_adaptation_rule(&self, plugin_id: &str, rule: AdaptationRule) {
        self.rules.insert(plugin_id.to_string(), rule);
    }

    pub fn remove_adaptation_rule(&self, plugin_id: &str) -> Option<AdaptationRule> {
        self.rules.remove(plugin_id).map(|(_, r)| r)
    }

    /// True iff a rule exists and the score is below its threshold
    pub fn should_adapt(&self, plugin_id: &str) -> bool {
        let Some(rule) = self.rules.get(plugin_id) else {
            return false;
        };
        let threshold = rule.adaptation_threshold.unwrap_or(self.config.adaptation_threshold);
        self.scores.get(plugin_id)
            .map(|s| s.score < threshold)
            .unwrap_or(false)
    }

    pub fn adaptation_strategy(&self, plugin_id: &str) -> Option<AdaptationPlan> {
        if !self.should_adapt(plugin_id) {
            return None;
        }
        self.rules.get(plugin_id).map(|rule| AdaptationPlan::from(rule.value()))
    }

    /// Write every score to `path` as JSON
    pub fn save_snapshot(&self, path: &Path) -> PluginResult<()> {
        let mut scores: Vec<TrustScore> = self.scores.iter().map(|e| e.value().clone()).collect();
        scores.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        let document = LedgerDocument { saved_at: self.clock.now(), scores };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(&document)?)?;
        debug!("Saved {} trust scores to {}", document.scores.len(), path.display());
        Ok(())
    }

    /// Replace scores with those stored at `path`, returning how many were loaded
    pub fn load_snapshot(&self, path: &Path) -> PluginResult<usize> {
        let bytes = fs::read(path)?;
        let document: LedgerDocument = serde_json::from_slice(&bytes).map_err(|e| {
            warn!("Trust snapshot {} is unreadable: {}", path.display(), e);
            PluginError::configuration_error(format!("invalid trust snapshot {}: {}", path.display(), e))
        })?;

        self.scores.clear();
        let count = document.scores.len();
        for score in document.scores {
            self.scores.insert(score.plugin_id.clone(), score);
        }
        info!("Loaded {} trust scores from {}", count, path.display());
        Ok(count)
    }
}
