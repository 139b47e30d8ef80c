//! Plugin lifecycle management with state machines.
//!
//! ```text
//!  Unloaded -> Loading -> Loaded -> Initialized -> Running <-> Paused
//!      ^          ^                                  |           |
//!      |          +------ reload ---- Stopped <------+-----------+
//!      |          +------ reload ---- Error   <------ (any state)
//!      +------------------ unload ------------------- (any state)
//! ```
//!
//! Transitions for one plugin identity are linearized through a per-identity mutex;
//! different identities never contend with each other.

use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use crate::clock::{system_clock, SharedClock};
use crate::plugin::error::{PluginError, PluginResult};

/// Plugin lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LifecycleState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    Initialized,
    Running,
    Paused,
    Stopped,
    Error,
}

impl LifecycleState {
    /// Stopped and Error can only be left through reload or unload
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Only a running plugin accepts executions
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Check if a transition to the target state is legal
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;
        match (*self, target) {
            (_, Error) | (_, Unloaded) => true,
            (Unloaded, Loading) | (Stopped, Loading) | (Error, Loading) => true,
            (Loading, Loaded) => true,
            (Loaded, Initialized) => true,
            (Initialized, Running) | (Paused, Running) => true,
            (Running, Paused) => true,
            (from, Stopped) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle events, derived from each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Load,
    LoadComplete,
    Initialize,
    Start,
    Pause,
    Resume,
    Stop,
    Fail,
    Unload,
    Reload,
}

impl LifecycleEvent {
    /// The event that a `from -> to` transition represents
    pub fn from_transition(from: LifecycleState, to: LifecycleState) -> Self {
        use LifecycleState::*;
        match (from, to) {
            (_, Error) => Self::Fail,
            (_, Unloaded) => Self::Unload,
            (Stopped, Loading) | (Error, Loading) => Self::Reload,
            (_, Loading) => Self::Load,
            (_, Loaded) => Self::LoadComplete,
            (_, Initialized) => Self::Initialize,
            (Paused, Running) => Self::Resume,
            (_, Running) => Self::Start,
            (_, Paused) => Self::Pause,
            (_, Stopped) => Self::Stop,
        }
    }

    /// State an event moves a plugin into
    pub fn target_state(&self) -> LifecycleState {
        match self {
            Self::Load | Self::Reload => LifecycleState::Loading,
            Self::LoadComplete => LifecycleState::Loaded,
            Self::Initialize => LifecycleState::Initialized,
            Self::Start | Self::Resume => LifecycleState::Running,
            Self::Pause => LifecycleState::Paused,
            Self::Stop => LifecycleState::Stopped,
            Self::Fail => LifecycleState::Error,
            Self::Unload => LifecycleState::Unloaded,
        }
    }
}

/// One entry in a plugin's append-only transition history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub event: LifecycleEvent,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

/// An error recorded against a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub state: LifecycleState,
    pub message: String,
}

/// Callback notified after a transition; errors are logged and ignored
pub type LifecycleHandler = Arc<dyn Fn(&str, &StateTransition) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Default)]
struct LifecycleRecord {
    state: LifecycleState,
    history: Vec<StateTransition>,
    errors: Vec<LifecycleErrorRecord>,
}

impl LifecycleRecord {
    /// Timestamp strictly after the previous history entry, even if the clock stalls
    fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.history.last() {
            Some(last) if now <= last.timestamp => last.timestamp + Duration::microseconds(1),
            _ => now,
        }
    }

    fn is_blank(&self) -> bool {
        self.state == LifecycleState::Unloaded && self.history.is_empty() && self.errors.is_empty()
    }
}

/// Per-plugin finite-state machine with history, error log and transition handlers
pub struct LifecycleManager {
    records: DashMap<String, Arc<Mutex<LifecycleRecord>>>,
    handlers: RwLock<Vec<(Option<LifecycleEvent>, LifecycleHandler)>>,
    clock: SharedClock,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl LifecycleManager {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Notify `handler` after every transition that represents `event`
    pub fn register_handler<F>(&self, event: LifecycleEvent, handler: F)
    where
        F: Fn(&str, &StateTransition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.write().push((Some(event), Arc::new(handler)));
    }

    /// Notify `handler` after every transition
    pub fn register_global_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &StateTransition) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.write().push((None, Arc::new(handler)));
    }

    /// Move `plugin_id` to `state`, recording `error` if given
    pub fn set_state(
        &self,
        plugin_id: &str,
        state: LifecycleState,
        error: Option<&str>,
    ) -> PluginResult<StateTransition> {
        self.transition(plugin_id, state, error, None)
    }

    /// Apply a lifecycle event; the event must match the transition it causes
    pub fn apply(&self, plugin_id: &str, event: LifecycleEvent) -> PluginResult<StateTransition> {
        self.transition(plugin_id, event.target_state(), None, Some(event))
    }

    /// Move to Error, recording `message`
    pub fn fail(&self, plugin_id: &str, message: &str) -> PluginResult<StateTransition> {
        self.set_state(plugin_id, LifecycleState::Error, Some(message))
    }

    /// Append to the error log without changing state
    pub fn record_error(&self, plugin_id: &str, message: &str) {
        let record = self.record_for(plugin_id);
        let mut record = record.lock();
        let entry = LifecycleErrorRecord {
            timestamp: self.clock.now(),
            state: record.state,
            message: message.to_string(),
        };
        record.errors.push(entry);
    }

    pub fn get_state(&self, plugin_id: &str) -> LifecycleState {
        self.records.get(plugin_id)
            .map(|r| r.lock().state)
            .unwrap_or_default()
    }

    pub fn get_state_history(&self, plugin_id: &str) -> Vec<StateTransition> {
        self.records.get(plugin_id)
            .map(|r| r.lock().history.clone())
            .unwrap_or_default()
    }

    pub fn get_errors(&self, plugin_id: &str) -> Vec<LifecycleErrorRecord> {
        self.records.get(plugin_id)
            .map(|r| r.lock().errors.clone())
            .unwrap_or_default()
    }

    pub fn transition_count(&self, plugin_id: &str) -> usize {
        self.records.get(plugin_id)
            .map(|r| r.lock().history.len())
            .unwrap_or(0)
    }

    /// Plugins currently in `state`, sorted by name
    pub fn plugins_in_state(&self, state: LifecycleState) -> Vec<String> {
        self.plugins_matching(|s| s == state)
    }

    /// Plugins that are running or paused
    pub fn active_plugins(&self) -> Vec<String> {
        self.plugins_matching(|s| s.is_active())
    }

    pub fn error_plugins(&self) -> Vec<String> {
        self.plugins_in_state(LifecycleState::Error)
    }

    /// Every plugin with lifecycle bookkeeping; unloaded plugins with a cleared record are skipped
    pub fn known_plugins(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.iter()
            .filter(|entry| !entry.value().lock().is_blank())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn plugins_matching<P: Fn(LifecycleState) -> bool>(&self, predicate: P) -> Vec<String> {
        let mut names: Vec<String> = self.records.iter()
            .filter(|entry| predicate(entry.value().lock().state))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    fn record_for(&self, plugin_id: &str) -> Arc<Mutex<LifecycleRecord>> {
        self.records.entry(plugin_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn transition(
        &self,
        plugin_id: &str,
        target: LifecycleState,
        error: Option<&str>,
        expected: Option<LifecycleEvent>,
    ) -> PluginResult<StateTransition> {
        let record = self.record_for(plugin_id);
        let transition = {
            let mut record = record.lock();
            let from = record.state;
            let event = LifecycleEvent::from_transition(from, target);

            let event_matches = match expected {
                None => true,
                Some(LifecycleEvent::Start) => matches!(event, LifecycleEvent::Start | LifecycleEvent::Resume),
                Some(requested) => requested == event,
            };
            if !from.can_transition_to(target) || !event_matches {
                warn!("Rejected transition for plugin '{}': {} -> {}", plugin_id, from, target);
                return Err(PluginError::invalid_transition(plugin_id, from, target));
            }

            let timestamp = record.next_timestamp(self.clock.now());
            let transition = StateTransition {
                from,
                to: target,
                event,
                timestamp,
                error: error.map(str::to_string),
            };

            // Reset in place; the map entry is never removed
            if target == LifecycleState::Unloaded {
                *record = LifecycleRecord::default();
            } else {
                if let Some(message) = error {
                    record.errors.push(LifecycleErrorRecord {
                        timestamp,
                        state: target,
                        message: message.to_string(),
                    });
                }
                record.history.push(transition.clone());
                record.state = target;
            }
            transition
        };

        debug!("Plugin '{}' {:?}: {} -> {}", plugin_id, transition.event, transition.from, transition.to);
        self.notify(plugin_id, &transition);
        Ok(transition)
    }

    fn notify(&self, plugin_id: &str, transition: &StateTransition) {
        let handlers: Vec<LifecycleHandler> = self.handlers.read()
            .iter()
            .filter(|(event, _)| event.map_or(true, |e| e == transition.event))
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if let Err(e) = handler(plugin_id, transition) {
                warn!("Lifecycle handler failed for plugin '{}' on {:?}: {}", plugin_id, transition.event, e);
            }
        }
    }
}
