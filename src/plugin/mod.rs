//! Plugin System Module
//!
//! Defines the plugin capability interface, plugin identities, the registry and the
//! error taxonomy shared by the rest of the runtime.
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use plugin_runtime::plugin::{PluginRegistry, Plugin};
//!
//! fn register(plugin: Arc<dyn Plugin>) -> plugin_runtime::plugin::PluginResult<()> {
//!     let mut registry = PluginRegistry::new();
//!     registry.register_plugin(plugin)
//! }
//! ```

pub mod traits;
pub mod error;
pub mod registry;

#[cfg(test)]
pub mod tests;

// Re-export core types for easier access
pub use traits::{Plugin, PluginInfo, PluginIdentity, PluginInput};
pub use error::{PluginError, PluginResult};
pub use registry::{PluginRegistry, SharedPluginRegistry};
