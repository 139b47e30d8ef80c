//! Plugin Runtime
//!
//! The orchestrating facade. A [`PluginRuntime`] owns one of each component and wires them
//! together: the dependency resolver fixes bootstrap order, the lifecycle manager gates
//! execution, the sandbox runs the call, and the trust ledger and version cache absorb the
//! outcome. Every step is announced through the injected [`Publisher`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use plugin_runtime::runtime::PluginRuntime;
//! # use plugin_runtime::plugin::Plugin;
//!
//! # async fn demo(alpha: Arc<dyn Plugin>) -> plugin_runtime::plugin::PluginResult<()> {
//! let runtime = PluginRuntime::builder().build()?;
//! runtime.register_plugin(alpha).await?;
//! runtime.bootstrap().await?;
//!
//! let result = runtime.execute("alpha", serde_json::Map::new(), None).await;
//! println!("{} in {:?}", result.status, result.duration);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use crate::cache::{CleanupStats, TestResults, VersionCache};
use crate::clock::{system_clock, SharedClock};
use crate::config::RuntimeConfig;
use crate::dependency::DependencyResolver;
use crate::lifecycle::{LifecycleErrorRecord, LifecycleEvent, LifecycleManager, LifecycleState, StateTransition};
use crate::notifications::{NotificationManager, Publisher, RuntimeEvent};
use crate::plugin::{Plugin, PluginError, PluginInput, PluginResult, SharedPluginRegistry};
use crate::sandbox::{ExecutionResult, ExecutionSandbox, FailureKind, ResourceProbe, SandboxStatsSnapshot, SysinfoProbe};
use crate::trust::{AdaptationStrategy, TrustLedger, TrustScore};

/// Builder for [`PluginRuntime`]
pub struct PluginRuntimeBuilder {
    config: RuntimeConfig,
    clock: Option<SharedClock>,
    publisher: Option<Arc<dyn Publisher<RuntimeEvent>>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    cache_enabled: bool,
}

impl PluginRuntimeBuilder {
    fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            clock: None,
            publisher: None,
            probe: None,
            cache_enabled: false,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Event sink; defaults to a fresh [`NotificationManager`]
    pub fn publisher(mut self, publisher: Arc<dyn Publisher<RuntimeEvent>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Resource sampler; defaults to [`SysinfoProbe`]
    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Open the version cache at the configured root
    pub fn with_version_cache(mut self) -> Self {
        self.cache_enabled = true;
        self
    }

    /// Open the version cache at `root`
    pub fn cache_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.config.cache.root = root.into();
        self.cache_enabled = true;
        self
    }

    pub fn build(self) -> PluginResult<PluginRuntime> {
        self.config.sandbox.validate()?;
        self.config.trust.validate()?;
        self.config.cache.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let probe = self.probe.unwrap_or_else(|| Arc::new(SysinfoProbe::new()));
        let publisher = self.publisher
            .unwrap_or_else(|| Arc::new(NotificationManager::<RuntimeEvent>::new()));

        let cache = if self.cache_enabled {
            let cache = VersionCache::open(self.config.cache.root.clone(), self.config.cache.clone(), clock.clone())?;
            Some(Arc::new(cache))
        } else {
            None
        };

        info!("Plugin runtime ready (version cache {})", if cache.is_some() { "enabled" } else { "disabled" });
        Ok(PluginRuntime {
            registry: SharedPluginRegistry::new(),
            resolver: Arc::new(DependencyResolver::new()),
            lifecycle: Arc::new(LifecycleManager::new(clock.clone())),
            trust: Arc::new(TrustLedger::new(self.config.trust.clone(), clock.clone())),
            sandbox: Arc::new(ExecutionSandbox::with_probe(self.config.sandbox.clone(), probe)),
            cache,
            publisher,
            config: self.config,
        })
    }
}

/// Composes resolver, lifecycle, sandbox, trust and version cache
pub struct PluginRuntime {
    config: RuntimeConfig,
    registry: SharedPluginRegistry,
    resolver: Arc<DependencyResolver>,
    lifecycle: Arc<LifecycleManager>,
    trust: Arc<TrustLedger>,
    sandbox: Arc<ExecutionSandbox>,
    cache: Option<Arc<VersionCache>>,
    publisher: Arc<dyn Publisher<RuntimeEvent>>,
}

impl PluginRuntime {
    pub fn builder() -> PluginRuntimeBuilder {
        PluginRuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> SharedPluginRegistry {
        self.registry.clone()
    }

    pub fn resolver(&self) -> Arc<DependencyResolver> {
        Arc::clone(&self.resolver)
    }

    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        Arc::clone(&self.lifecycle)
    }

    pub fn trust(&self) -> Arc<TrustLedger> {
        Arc::clone(&self.trust)
    }

    pub fn sandbox(&self) -> Arc<ExecutionSandbox> {
        Arc::clone(&self.sandbox)
    }

    pub fn version_cache(&self) -> Option<Arc<VersionCache>> {
        self.cache.clone()
    }

    pub fn publisher(&self) -> Arc<dyn Publisher<RuntimeEvent>> {
        Arc::clone(&self.publisher)
    }

    /// Register a plugin, its trust entry and its resolver node
    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> PluginResult<()> {
        let info = plugin.plugin_info().clone();
        self.registry.inner().write().await.register_plugin(Arc::clone(&plugin))?;

        self.trust.register(&info.name);
        self.resolver.register(&info.name, info.dependencies.clone(), move |_| Ok(Arc::clone(&plugin)));

        debug!("Registered plugin '{}' ({}) depending on {:?}", info.name, info.version, info.dependencies);
        self.publish(RuntimeEvent::plugin_registered(&info.name, &info.version, &info.dependencies)).await;
        Ok(())
    }

    /// Unload a plugin if needed and forget it entirely
    pub async fn unregister_plugin(&self, plugin_id: &str) -> PluginResult<()> {
        if self.lifecycle.get_state(plugin_id) != LifecycleState::Unloaded {
            let transition = self.lifecycle.apply(plugin_id, LifecycleEvent::Unload)?;
            self.publish(RuntimeEvent::state_changed(plugin_id, &transition)).await;
        }
        self.resolver.remove(plugin_id);
        self.trust.remove(plugin_id);
        self.registry.inner().write().await.unregister_plugin(plugin_id).await
    }

    /// Construct everything in dependency order and bring each plugin up to Running.
    ///
    /// Returns the plugins started by this call, in initialization order. Plugins that already
    /// left Unloaded are skipped.
    pub async fn bootstrap(&self) -> PluginResult<Vec<String>> {
        self.resolver.resolve_all()?;
        let order = self.resolver.initialization_order()?;
        info!("Bootstrapping {} components: {}", order.len(), order.join(", "));

        let mut started = Vec::new();
        for name in order {
            if !self.registry.inner().read().await.contains(&name) {
                continue;
            }
            if self.lifecycle.get_state(&name) != LifecycleState::Unloaded {
                debug!("Skipping '{}' during bootstrap; already {}", name, self.lifecycle.get_state(&name));
                continue;
            }
            self.drive(&name, &[
                LifecycleEvent::Load,
                LifecycleEvent::LoadComplete,
                LifecycleEvent::Initialize,
                LifecycleEvent::Start,
            ]).await?;
            started.push(name);
        }
        Ok(started)
    }

    /// Bring a single plugin to Running from wherever it is
    pub async fn start(&self, plugin_id: &str) -> PluginResult<()> {
        self.require_registered(plugin_id).await?;
        self.resolver.resolve(plugin_id)?;

        use LifecycleEvent::*;
        let events: &[LifecycleEvent] = match self.lifecycle.get_state(plugin_id) {
            LifecycleState::Unloaded => &[Load, LoadComplete, Initialize, Start],
            LifecycleState::Stopped | LifecycleState::Error => &[Reload, LoadComplete, Initialize, Start],
            LifecycleState::Loading => &[LoadComplete, Initialize, Start],
            LifecycleState::Loaded => &[Initialize, Start],
            LifecycleState::Initialized | LifecycleState::Paused => &[Start],
            LifecycleState::Running => &[],
        };
        self.drive(plugin_id, events).await
    }

    pub async fn pause(&self, plugin_id: &str) -> PluginResult<()> {
        self.drive(plugin_id, &[LifecycleEvent::Pause]).await
    }

    pub async fn resume(&self, plugin_id: &str) -> PluginResult<()> {
        self.drive(plugin_id, &[LifecycleEvent::Resume]).await
    }

    pub async fn stop(&self, plugin_id: &str) -> PluginResult<()> {
        self.drive(plugin_id, &[LifecycleEvent::Stop]).await
    }

    /// Return a plugin to Unloaded and run its cleanup hook. The plugin stays registered.
    pub async fn unload(&self, plugin_id: &str) -> PluginResult<()> {
        let plugin = self.require_registered(plugin_id).await?;
        self.drive(plugin_id, &[LifecycleEvent::Unload]).await?;
        plugin.cleanup().await.map_err(|e| {
            warn!("Cleanup of plugin '{}' failed: {}", plugin_id, e);
            e
        })
    }

    /// Stop every running or paused plugin. Returns the plugins stopped.
    pub async fn shutdown(&self) -> Vec<String> {
        let active = self.lifecycle.active_plugins();
        let mut stopped = Vec::with_capacity(active.len());
        for plugin_id in active {
            match self.stop(&plugin_id).await {
                Ok(()) => stopped.push(plugin_id),
                Err(e) => warn!("Failed to stop '{}' during shutdown: {}", plugin_id, e),
            }
        }
        info!("Runtime shut down; stopped {} plugins", stopped.len());
        stopped
    }

    /// Run a plugin in the sandbox. Never fails: every outcome is an [`ExecutionResult`].
    pub async fn execute(&self, plugin_id: &str, input: PluginInput, timeout: Option<Duration>) -> ExecutionResult {
        let state = self.lifecycle.get_state(plugin_id);
        let plugin = match self.registry.get(plugin_id).await {
            Some(plugin) if state.is_runnable() => plugin,
            Some(_) => {
                let message = format!("plugin '{}' is {} and cannot execute", plugin_id, state);
                return self.reject(plugin_id, &input, message).await;
            }
            None => {
                let message = PluginError::plugin_not_found(plugin_id).to_string();
                return self.reject(plugin_id, &input, message).await;
            }
        };

        let mut keys: Vec<String> = input.keys().cloned().collect();
        keys.sort();
        self.publish(RuntimeEvent::execution_started(plugin_id, &keys)).await;

        let result = self.sandbox.execute_with_monitoring(plugin_id, plugin, input, timeout).await;

        let score = self.trust.record_outcome(plugin_id, &result);
        if !result.is_success() {
            let message = result.error.as_deref().unwrap_or("execution failed");
            self.lifecycle.record_error(plugin_id, &format!("{}: {}", result.status, message));
        }
        self.touch_latest_version(plugin_id);

        self.publish(RuntimeEvent::execution_completed(&result)).await;
        if let Some(plan) = self.trust.adaptation_strategy(plugin_id) {
            info!("Plugin '{}' trust {:.3} is below its adaptation threshold", plugin_id, score.score);
            self.publish(RuntimeEvent::adaptation_required(plugin_id, score.score, &plan)).await;
        }
        result
    }

    /// Execute, and on failure follow the plugin's adaptation plan if its trust calls for one
    pub async fn execute_with_adaptation(&self, plugin_id: &str, input: PluginInput) -> ExecutionResult {
        let first = self.execute(plugin_id, input.clone(), None).await;
        if first.is_success() || first.failure_kind == Some(FailureKind::NotRunnable) {
            return first;
        }
        let Some(plan) = self.trust.adaptation_strategy(plugin_id) else {
            return first;
        };

        match plan.strategy {
            AdaptationStrategy::Retry => {
                let mut last = first;
                for attempt in 1..=plan.retry_count {
                    info!("Retrying '{}' (attempt {}/{})", plugin_id, attempt, plan.retry_count);
                    last = self.execute(plugin_id, input.clone(), plan.timeout).await;
                    if last.is_success() {
                        break;
                    }
                }
                last
            }
            AdaptationStrategy::Fallback => match plan.fallback_plugin.as_deref() {
                Some(fallback) if fallback != plugin_id => {
                    info!("Falling back from '{}' to '{}'", plugin_id, fallback);
                    self.execute(fallback, input, plan.timeout).await
                }
                _ => {
                    warn!("Adaptation plan for '{}' names no usable fallback plugin", plugin_id);
                    first
                }
            },
            AdaptationStrategy::Disable => {
                info!("Disabling plugin '{}' after failure", plugin_id);
                if let Err(e) = self.stop(plugin_id).await {
                    warn!("Could not disable '{}': {}", plugin_id, e);
                }
                first
            }
        }
    }

    /// Copy `source_dir` into the version cache as the next version of `name`
    pub async fn cache_version(
        &self,
        name: &str,
        source_dir: &Path,
        test_results: TestResults,
        dependencies: &[String],
        description: &str,
    ) -> PluginResult<String> {
        let cache = self.require_cache()?;
        let versioned = cache.cache_version(name, source_dir, test_results, dependencies.iter().cloned(), description)?;
        self.publish(RuntimeEvent::version_cached(name, &versioned)).await;
        Ok(versioned)
    }

    /// Apply the retention policy to `name`; a runtime without a cache reports nothing removed
    pub async fn cleanup(&self, name: &str) -> CleanupStats {
        let Some(cache) = &self.cache else {
            debug!("Version cache disabled; nothing to clean for '{}'", name);
            return CleanupStats::default();
        };
        let stats = cache.cleanup(name);
        self.publish(RuntimeEvent::cache_cleaned(name, &stats)).await;
        stats
    }

    /// Prune failed ephemeral instances once more than `threshold` have accumulated
    pub async fn cleanup_failed(&self, failed_ids: &[String], threshold: usize) -> CleanupStats {
        let Some(cache) = &self.cache else {
            return CleanupStats::default();
        };
        let stats = cache.cleanup_failed(failed_ids, threshold);
        if stats.removed_plugins > 0 {
            self.publish(RuntimeEvent::cache_cleaned("failed", &stats)).await;
        }
        stats
    }

    pub fn get_state(&self, plugin_id: &str) -> LifecycleState {
        self.lifecycle.get_state(plugin_id)
    }

    pub fn trust_score(&self, plugin_id: &str) -> Option<TrustScore> {
        self.trust.get_score(plugin_id)
    }

    pub fn state_history(&self, plugin_id: &str) -> Vec<StateTransition> {
        self.lifecycle.get_state_history(plugin_id)
    }

    pub fn errors(&self, plugin_id: &str) -> Vec<LifecycleErrorRecord> {
        self.lifecycle.get_errors(plugin_id)
    }

    pub fn sandbox_stats(&self) -> SandboxStatsSnapshot {
        self.sandbox.stats()
    }

    async fn drive(&self, plugin_id: &str, events: &[LifecycleEvent]) -> PluginResult<()> {
        for event in events {
            let transition = self.lifecycle.apply(plugin_id, *event)?;
            self.publish(RuntimeEvent::state_changed(plugin_id, &transition)).await;
        }
        Ok(())
    }

    async fn require_registered(&self, plugin_id: &str) -> PluginResult<Arc<dyn Plugin>> {
        self.registry.get(plugin_id).await
            .ok_or_else(|| PluginError::plugin_not_found(plugin_id))
    }

    fn require_cache(&self) -> PluginResult<&Arc<VersionCache>> {
        self.cache.as_ref()
            .ok_or_else(|| PluginError::cache_error("version cache is not enabled for this runtime"))
    }

    async fn reject(&self, plugin_id: &str, input: &PluginInput, message: String) -> ExecutionResult {
        warn!("Refusing to execute '{}': {}", plugin_id, message);
        let result = ExecutionResult::not_runnable(plugin_id, input, message);
        self.sandbox.execution_log().write(&result).await;
        self.publish(RuntimeEvent::execution_completed(&result)).await;
        result
    }

    fn touch_latest_version(&self, plugin_id: &str) {
        let Some(cache) = &self.cache else { return };
        if let Some(latest) = cache.get_latest(plugin_id) {
            if let Err(e) = cache.record_usage(&latest) {
                warn!("Could not record usage of {}: {}", latest, e);
            }
        }
    }

    async fn publish(&self, event: RuntimeEvent) {
        let event_type = event.event_type;
        if let Err(e) = self.publisher.publish(event).await {
            warn!("Failed to publish {:?} event: {}", event_type, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;
    use crate::clock::{Clock, ManualClock};
    use crate::notifications::{NotificationResult, RuntimeEventType};
    use crate::plugin::tests::mock_plugins::*;
    use crate::sandbox::{ExecutionStatus, SandboxConfig};
    use crate::trust::AdaptationRule;

    /// Publisher that remembers every event
    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<RuntimeEvent>>,
    }

    impl RecordingPublisher {
        fn types(&self) -> Vec<RuntimeEventType> {
            self.events.lock().iter().map(|e| e.event_type).collect()
        }

        fn count(&self, event_type: RuntimeEventType) -> usize {
            self.events.lock().iter().filter(|e| e.event_type == event_type).count()
        }
    }

    #[async_trait]
    impl Publisher<RuntimeEvent> for RecordingPublisher {
        async fn publish(&self, event: RuntimeEvent) -> NotificationResult<()> {
            self.events.lock().push(event);
            Ok(())
        }

        fn publisher_id(&self) -> &str {
            "recording"
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            sandbox: SandboxConfig::default()
                .with_timeout(Duration::from_millis(500))
                .with_sample_interval(Duration::from_millis(10))
                .with_execution_log_dir(None),
            ..RuntimeConfig::default()
        }
    }

    fn runtime_with(publisher: Arc<RecordingPublisher>) -> PluginRuntime {
        PluginRuntime::builder()
            .config(config())
            .publisher(publisher)
            .probe(Arc::new(ScriptedProbe::steady(50.0)))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_follows_dependency_order() {
        let publisher = Arc::new(RecordingPublisher::default());
        let runtime = runtime_with(publisher.clone());

        runtime.register_plugin(Arc::new(MockPlugin::echo("alpha").with_dependency("beta"))).await.unwrap();
        runtime.register_plugin(Arc::new(MockPlugin::echo("beta"))).await.unwrap();

        let started = runtime.bootstrap().await.unwrap();
        assert_eq!(started, vec!["beta", "alpha"]);
        assert_eq!(runtime.get_state("alpha"), LifecycleState::Running);
        assert_eq!(runtime.state_history("alpha").len(), 4);
        assert_eq!(publisher.count(RuntimeEventType::PluginRegistered), 2);
        assert_eq!(publisher.count(RuntimeEventType::StateChanged), 8);

        // Already running plugins are left alone
        assert!(runtime.bootstrap().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_fails_on_missing_dependency() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        runtime.register_plugin(Arc::new(MockPlugin::echo("alpha").with_dependency("ghost"))).await.unwrap();

        let err = runtime.bootstrap().await.unwrap_err();
        assert!(err.is_dependency_error());
        assert_eq!(runtime.get_state("alpha"), LifecycleState::Unloaded);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_on_cycle() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        runtime.register_plugin(Arc::new(MockPlugin::echo("a").with_dependency("b"))).await.unwrap();
        runtime.register_plugin(Arc::new(MockPlugin::echo("b").with_dependency("a"))).await.unwrap();

        assert!(matches!(runtime.bootstrap().await, Err(PluginError::CircularDependency { .. })));
    }

    #[tokio::test]
    async fn test_execute_success_updates_trust_and_events() {
        let publisher = Arc::new(RecordingPublisher::default());
        let runtime = runtime_with(publisher.clone());
        runtime.register_plugin(Arc::new(MockPlugin::echo("alpha"))).await.unwrap();
        runtime.bootstrap().await.unwrap();

        let result = runtime.execute("alpha", input(&[("text", json!("hi"))]), None).await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.output.unwrap()["echo"]["text"], "hi");
        assert_eq!(runtime.trust().history("alpha").len(), 1);
        assert_eq!(runtime.sandbox_stats().successes, 1);
        let types = publisher.types();
        let started = types.iter().position(|t| *t == RuntimeEventType::ExecutionStarted).unwrap();
        let completed = types.iter().position(|t| *t == RuntimeEventType::ExecutionCompleted).unwrap();
        assert!(started < completed);
    }

    #[tokio::test]
    async fn test_execute_rejects_unknown_and_stopped_plugins() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));

        let unknown = runtime.execute("ghost", PluginInput::new(), None).await;
        assert_eq!(unknown.status, ExecutionStatus::Error);
        assert_eq!(unknown.failure_kind, Some(FailureKind::NotRunnable));

        let plugin = Arc::new(MockPlugin::echo("alpha"));
        runtime.register_plugin(plugin.clone()).await.unwrap();
        let before = runtime.trust_score("alpha").unwrap();

        let unloaded = runtime.execute("alpha", PluginInput::new(), None).await;
        assert_eq!(unloaded.failure_kind, Some(FailureKind::NotRunnable));
        assert_eq!(plugin.execution_count(), 0);
        assert_eq!(runtime.trust_score("alpha").unwrap().score, before.score);
        assert!(runtime.trust().history("alpha").is_empty());
    }

    #[tokio::test]
    async fn test_failures_reach_error_log_but_not_lifecycle_state() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        runtime.register_plugin(Arc::new(MockPlugin::failing("flaky", "boom"))).await.unwrap();
        runtime.bootstrap().await.unwrap();

        let result = runtime.execute("flaky", PluginInput::new(), None).await;
        assert_eq!(result.status, ExecutionStatus::Error);

        assert_eq!(runtime.get_state("flaky"), LifecycleState::Running);
        let errors = runtime.errors("flaky");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("boom"));
        assert!(runtime.trust_score("flaky").unwrap().reliability < 1.0);
    }

    #[tokio::test]
    async fn test_timeout_penalizes_performance() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        runtime.register_plugin(Arc::new(MockPlugin::sleeper("slow", Duration::from_secs(10)))).await.unwrap();
        runtime.bootstrap().await.unwrap();

        let result = runtime.execute("slow", PluginInput::new(), Some(Duration::from_millis(50))).await;
        assert_eq!(result.status, ExecutionStatus::Timeout);

        let score = runtime.trust_score("slow").unwrap();
        assert!(score.performance < score.reliability);
        assert_eq!(runtime.sandbox().active_samplers(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_controls() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        let plugin = Arc::new(MockPlugin::echo("alpha"));
        runtime.register_plugin(plugin.clone()).await.unwrap();

        runtime.start("alpha").await.unwrap();
        assert_eq!(runtime.get_state("alpha"), LifecycleState::Running);

        runtime.pause("alpha").await.unwrap();
        let paused = runtime.execute("alpha", PluginInput::new(), None).await;
        assert_eq!(paused.failure_kind, Some(FailureKind::NotRunnable));

        runtime.resume("alpha").await.unwrap();
        runtime.stop("alpha").await.unwrap();
        assert_eq!(runtime.get_state("alpha"), LifecycleState::Stopped);
        assert!(runtime.pause("alpha").await.unwrap_err().is_lifecycle_error());

        // Restarting a stopped plugin goes through a reload
        runtime.start("alpha").await.unwrap();
        let history = runtime.state_history("alpha");
        assert!(history.iter().any(|t| t.event == LifecycleEvent::Reload));

        runtime.unload("alpha").await.unwrap();
        assert_eq!(runtime.get_state("alpha"), LifecycleState::Unloaded);
        assert!(runtime.state_history("alpha").is_empty());
        assert_eq!(plugin.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_plugins() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        for name in ["a", "b", "c"] {
            runtime.register_plugin(Arc::new(MockPlugin::echo(name))).await.unwrap();
        }
        runtime.bootstrap().await.unwrap();
        runtime.pause("b").await.unwrap();

        let stopped = runtime.shutdown().await;
        assert_eq!(stopped, vec!["a", "b", "c"]);
        assert!(runtime.lifecycle().active_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_forgets_plugin() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        let plugin = Arc::new(MockPlugin::echo("alpha"));
        runtime.register_plugin(plugin.clone()).await.unwrap();
        runtime.bootstrap().await.unwrap();

        runtime.unregister_plugin("alpha").await.unwrap();
        assert!(runtime.registry().get("alpha").await.is_none());
        assert!(!runtime.resolver().is_registered("alpha"));
        assert!(runtime.trust_score("alpha").is_none());
        assert_eq!(plugin.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn test_adaptation_retry() {
        let publisher = Arc::new(RecordingPublisher::default());
        let runtime = runtime_with(publisher.clone());
        let plugin = Arc::new(MockPlugin::failing("flaky", "boom"));
        runtime.register_plugin(plugin.clone()).await.unwrap();
        runtime.bootstrap().await.unwrap();
        runtime.trust().set_adaptation_rule("flaky", AdaptationRule::retry(2).with_threshold(0.99));

        let result = runtime.execute_with_adaptation("flaky", PluginInput::new()).await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(plugin.execution_count(), 3);
        assert_eq!(publisher.count(RuntimeEventType::AdaptationRequired), 3);
    }

    #[tokio::test]
    async fn test_adaptation_fallback() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        runtime.register_plugin(Arc::new(MockPlugin::failing("primary", "down"))).await.unwrap();
        let backup = Arc::new(MockPlugin::echo("backup"));
        runtime.register_plugin(backup.clone()).await.unwrap();
        runtime.bootstrap().await.unwrap();
        runtime.trust().set_adaptation_rule("primary", AdaptationRule::fallback("backup").with_threshold(0.99));

        let result = runtime.execute_with_adaptation("primary", input(&[("q", json!(1))])).await;
        assert!(result.is_success());
        assert_eq!(result.plugin_id(), "backup");
        assert_eq!(backup.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_adaptation_disable() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        runtime.register_plugin(Arc::new(MockPlugin::failing("bad", "nope"))).await.unwrap();
        runtime.bootstrap().await.unwrap();
        runtime.trust().set_adaptation_rule("bad", AdaptationRule::disable().with_threshold(0.99));

        runtime.execute_with_adaptation("bad", PluginInput::new()).await;
        assert_eq!(runtime.get_state("bad"), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_no_adaptation_above_threshold() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        let plugin = Arc::new(MockPlugin::failing("flaky", "boom"));
        runtime.register_plugin(plugin.clone()).await.unwrap();
        runtime.bootstrap().await.unwrap();
        runtime.trust().set_adaptation_rule("flaky", AdaptationRule::retry(5));

        runtime.execute_with_adaptation("flaky", PluginInput::new()).await;
        assert_eq!(plugin.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_version_cache_pass_through() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("main.py"), "print('hi')").unwrap();

        let clock = Arc::new(ManualClock::starting_now());
        let publisher = Arc::new(RecordingPublisher::default());
        let runtime = PluginRuntime::builder()
            .config(config())
            .clock(clock.clone())
            .publisher(publisher.clone())
            .probe(Arc::new(ScriptedProbe::steady(0.0)))
            .cache_root(temp.path().join("cache"))
            .build()
            .unwrap();

        let versioned = runtime
            .cache_version("alpha", &source, TestResults::new(4, 4), &["beta".to_string()], "first")
            .await
            .unwrap();
        assert_eq!(versioned, "alpha_v1");
        assert_eq!(publisher.count(RuntimeEventType::VersionCached), 1);

        runtime.register_plugin(Arc::new(MockPlugin::echo("alpha"))).await.unwrap();
        runtime.bootstrap().await.unwrap();
        clock.advance_days(2);
        runtime.execute("alpha", PluginInput::new(), None).await;

        let cache = runtime.version_cache().unwrap();
        assert_eq!(cache.get_metadata("alpha_v1").unwrap().last_used, clock.now());

        let stats = runtime.cleanup("alpha").await;
        assert_eq!(stats.total_plugins, 1);
        assert_eq!(stats.removed_plugins, 0);
        assert_eq!(publisher.count(RuntimeEventType::CacheCleaned), 1);
    }

    #[tokio::test]
    async fn test_cache_disabled() {
        let runtime = runtime_with(Arc::new(RecordingPublisher::default()));
        let temp = TempDir::new().unwrap();

        let err = runtime.cache_version("alpha", temp.path(), TestResults::new(1, 1), &[], "").await;
        assert!(matches!(err, Err(PluginError::CacheError { .. })));
        assert_eq!(runtime.cleanup("alpha").await, CleanupStats::default());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = config();
        config.trust.decay_factor = 0.0;
        assert!(PluginRuntime::builder().config(config).build().is_err());

        let mut config = self::config();
        config.cache.max_versions = 0;
        let err = PluginRuntime::builder().config(config).build().err().unwrap();
        assert!(matches!(err, PluginError::ConfigurationError { .. }));

        let mut config = self::config();
        config.cache.min_success_rate = 1.5;
        assert!(PluginRuntime::builder().config(config).build().is_err());
    }
}
