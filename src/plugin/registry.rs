//! Plugin Registry
//!
//! Explicit registration and lookup of plugin instances by name.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use log::{debug, warn};
use crate::plugin::traits::Plugin;
use crate::plugin::error::{PluginError, PluginResult};

/// Registry for managing plugin instances
#[derive(Default)]
pub struct PluginRegistry {
    /// Registered plugins by name
    plugins: HashMap<String, Arc<dyn Plugin>>,

    /// Names in registration order
    order: Vec<String>,
}

impl PluginRegistry {
    /// Create a new plugin registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> PluginResult<()> {
        let name = plugin.plugin_info().name.clone();

        if self.plugins.contains_key(&name) {
            return Err(PluginError::plugin_already_registered(&name));
        }

        debug!("Registered plugin '{}'", name);
        self.order.push(name.clone());
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Unregister a plugin, running its cleanup hook
    pub async fn unregister_plugin(&mut self, name: &str) -> PluginResult<()> {
        let plugin = self.plugins.remove(name)
            .ok_or_else(|| PluginError::plugin_not_found(name))?;
        self.order.retain(|n| n != name);

        if let Err(e) = plugin.cleanup().await {
            warn!("Cleanup of plugin '{}' failed: {}", name, e);
            return Err(e);
        }
        Ok(())
    }

    /// Get a plugin by name
    pub fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Check whether a plugin is registered
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// List all registered plugin names in registration order
    pub fn list_plugins(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Get the count of registered plugins
    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }
}

/// Thread-safe plugin registry wrapper
#[derive(Clone, Default)]
pub struct SharedPluginRegistry {
    inner: Arc<RwLock<PluginRegistry>>,
}

impl SharedPluginRegistry {
    /// Create a new shared plugin registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the inner registry for direct access
    pub fn inner(&self) -> &Arc<RwLock<PluginRegistry>> {
        &self.inner
    }

    /// Look up a plugin without holding the lock afterwards
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.inner.read().await.get_plugin(name)
    }
}
