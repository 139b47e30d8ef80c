//! End-to-End Integration Tests
//!
//! Full workflows through the public API: dependency resolution and memoization, bootstrap,
//! sandboxed execution feeding the trust ledger, and events reaching subscribers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_test::{assert_err, assert_ok};

use plugin_runtime::dependency::DependencyResolver;
use plugin_runtime::notifications::{
    NotificationManager, NotificationResult, RuntimeEvent, RuntimeEventType, Subscriber,
};
use plugin_runtime::sandbox::{FailureKind, ResourceProbe, ResourceSample, SandboxConfig};
use plugin_runtime::{
    ExecutionStatus, LifecycleState, Plugin, PluginError, PluginInfo, PluginInput, PluginResult,
    PluginRuntime, RuntimeConfig,
};

/// Word counter used as a realistic plugin
struct WordCount {
    info: PluginInfo,
}

impl WordCount {
    fn new() -> Self {
        Self { info: PluginInfo::new("word_count", "1.0.0").with_dependency("tokenizer") }
    }
}

#[async_trait]
impl Plugin for WordCount {
    fn plugin_info(&self) -> &PluginInfo {
        &self.info
    }

    async fn execute(&self, input: PluginInput) -> PluginResult<Value> {
        let text = input.get("text").and_then(Value::as_str).unwrap_or_default();
        Ok(json!({ "words": text.split_whitespace().count() }))
    }

    fn validate(&self, input: &PluginInput) -> PluginResult<()> {
        match input.get("text") {
            Some(Value::String(_)) => Ok(()),
            _ => Err(PluginError::invalid_input("'text' must be a string")),
        }
    }
}

/// Plugin that never finishes within a test timeout
struct Stalls {
    info: PluginInfo,
}

#[async_trait]
impl Plugin for Stalls {
    fn plugin_info(&self) -> &PluginInfo {
        &self.info
    }

    async fn execute(&self, _input: PluginInput) -> PluginResult<Value> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Value::Null)
    }
}

/// Plugin with no behaviour, used as a dependency
struct Tokenizer {
    info: PluginInfo,
}

#[async_trait]
impl Plugin for Tokenizer {
    fn plugin_info(&self) -> &PluginInfo {
        &self.info
    }

    async fn execute(&self, _input: PluginInput) -> PluginResult<Value> {
        Ok(json!({ "ready": true }))
    }
}

struct FlatProbe;

impl ResourceProbe for FlatProbe {
    fn sample(&self) -> ResourceSample {
        ResourceSample { memory_mb: 64.0, cpu_percent: 5.0 }
    }
}

struct Collector {
    events: Mutex<Vec<RuntimeEvent>>,
}

#[async_trait]
impl Subscriber<RuntimeEvent> for Collector {
    async fn handle_event(&self, event: RuntimeEvent) -> NotificationResult<()> {
        self.events.lock().await.push(event);
        Ok(())
    }

    fn subscriber_id(&self) -> &str {
        "collector"
    }
}

fn input(text: &str) -> PluginInput {
    let mut input = PluginInput::new();
    input.insert("text".to_string(), json!(text));
    input
}

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        sandbox: SandboxConfig::default()
            .with_timeout(Duration::from_secs(2))
            .with_sample_interval(Duration::from_millis(20))
            .with_execution_log_dir(None),
        ..RuntimeConfig::default()
    }
}

#[test]
fn test_alpha_resolves_beta_first_and_memoizes_both() {
    let resolver = DependencyResolver::new();
    let constructed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let alpha_calls = Arc::new(AtomicUsize::new(0));
    let beta_calls = Arc::new(AtomicUsize::new(0));

    {
        let constructed = constructed.clone();
        let calls = alpha_calls.clone();
        resolver.register("alpha", ["beta"], move |deps| {
            calls.fetch_add(1, Ordering::SeqCst);
            constructed.lock().unwrap().push("alpha");
            let beta = deps.get_as::<String>("beta")?;
            Ok(format!("alpha({})", beta))
        });
    }
    {
        let constructed = constructed.clone();
        let calls = beta_calls.clone();
        resolver.register("beta", Vec::<String>::new(), move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            constructed.lock().unwrap().push("beta");
            Ok("beta".to_string())
        });
    }

    let first = assert_ok!(resolver.resolve_as::<String>("alpha"));
    assert_eq!(first.as_str(), "alpha(beta)");
    assert_eq!(*constructed.lock().unwrap(), vec!["beta", "alpha"]);

    let second = assert_ok!(resolver.resolve_as::<String>("alpha"));
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(alpha_calls.load(Ordering::SeqCst), 1);
    assert_eq!(beta_calls.load(Ordering::SeqCst), 1);
    assert!(resolver.is_resolved("beta"));
}

#[tokio::test]
async fn test_full_runtime_workflow() {
    let manager = NotificationManager::<RuntimeEvent>::new();
    let collector = Arc::new(Collector { events: Mutex::new(Vec::new()) });
    assert_ok!(manager.subscribe(collector.clone()).await);

    let runtime = assert_ok!(PluginRuntime::builder()
        .config(test_config())
        .publisher(Arc::new(manager.clone()))
        .probe(Arc::new(FlatProbe))
        .build());

    assert_ok!(runtime.register_plugin(Arc::new(WordCount::new())).await);
    assert_ok!(runtime.register_plugin(Arc::new(Tokenizer { info: PluginInfo::new("tokenizer", "0.3.0") })).await);

    let started = assert_ok!(runtime.bootstrap().await);
    assert_eq!(started, vec!["tokenizer", "word_count"]);
    assert_eq!(runtime.get_state("word_count"), LifecycleState::Running);

    let result = runtime.execute("word_count", input("the quick brown fox"), None).await;
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.output.as_ref().unwrap()["words"], 4);
    assert_eq!(result.metadata.input.keys, vec!["text"]);
    assert!(result.error.is_none());

    let invalid = runtime.execute("word_count", PluginInput::new(), None).await;
    assert_eq!(invalid.status, ExecutionStatus::Error);
    assert_eq!(invalid.failure_kind, Some(FailureKind::InvalidInput));

    let score = runtime.trust_score("word_count").unwrap();
    assert_eq!(runtime.trust().history("word_count").len(), 2);
    assert!(score.reliability < 1.0);
    assert_eq!(runtime.errors("word_count").len(), 1);

    let events = collector.events.lock().await;
    let registered = events.iter().filter(|e| e.event_type == RuntimeEventType::PluginRegistered).count();
    let completed = events.iter().filter(|e| e.event_type == RuntimeEventType::ExecutionCompleted).count();
    assert_eq!(registered, 2);
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_timeout_is_reported_and_nothing_leaks() {
    let runtime = assert_ok!(PluginRuntime::builder()
        .config(test_config())
        .probe(Arc::new(FlatProbe))
        .build());
    assert_ok!(runtime.register_plugin(Arc::new(Stalls { info: PluginInfo::new("stalls", "1.0.0") })).await);
    assert_ok!(runtime.bootstrap().await);

    let result = runtime.execute("stalls", PluginInput::new(), Some(Duration::from_millis(100))).await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.error.as_deref().unwrap().contains("timeout"));
    assert!(result.duration < Duration::from_secs(5));
    assert_eq!(runtime.sandbox().active_samplers(), 0);
    assert_eq!(runtime.sandbox_stats().timeouts, 1);
    assert_eq!(runtime.get_state("stalls"), LifecycleState::Running);
}

#[tokio::test]
async fn test_stopped_plugin_is_refused_until_restarted() {
    let runtime = assert_ok!(PluginRuntime::builder()
        .config(test_config())
        .probe(Arc::new(FlatProbe))
        .build());
    assert_ok!(runtime.register_plugin(Arc::new(Tokenizer { info: PluginInfo::new("tokenizer", "0.3.0") })).await);
    assert_ok!(runtime.bootstrap().await);

    assert_eq!(runtime.shutdown().await, vec!["tokenizer"]);
    let refused = runtime.execute("tokenizer", PluginInput::new(), None).await;
    assert_eq!(refused.failure_kind, Some(FailureKind::NotRunnable));
    assert!(runtime.trust().history("tokenizer").is_empty());

    assert_err!(runtime.resume("tokenizer").await);
    assert_ok!(runtime.start("tokenizer").await);
    assert!(runtime.execute("tokenizer", PluginInput::new(), None).await.is_success());
}
