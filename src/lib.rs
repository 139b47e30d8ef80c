//! Local plugin runtime
//!
//! Takes named, versioned plugins through dependency-ordered bootstrap and a lifecycle state
//! machine, runs them under a deadline and memory ceiling, scores their reliability with a
//! decaying trust ledger, and retires stale or failing cached versions.

pub mod cache;
pub mod clock;
pub mod config;
pub mod dependency;
pub mod lifecycle;
pub mod logging;
pub mod notifications;
pub mod plugin;
pub mod runtime;
pub mod sandbox;
pub mod trust;
pub mod units;

pub use cache::{CacheConfig, CleanupStats, PluginVersionMetadata, TestResults, VersionCache};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigManager, RuntimeConfig};
pub use dependency::DependencyResolver;
pub use lifecycle::{LifecycleEvent, LifecycleManager, LifecycleState, StateTransition};
pub use plugin::{Plugin, PluginError, PluginIdentity, PluginInfo, PluginInput, PluginResult};
pub use runtime::{PluginRuntime, PluginRuntimeBuilder};
pub use sandbox::{ExecutionResult, ExecutionSandbox, ExecutionStatus, SandboxConfig};
pub use trust::{AdaptationRule, AdaptationStrategy, TrustConfig, TrustLedger, TrustScore};
