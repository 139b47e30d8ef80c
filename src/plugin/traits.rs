//! Core Plugin Traits
//!
//! A plugin is any value implementing [`Plugin`]: an async `execute` entry point plus
//! optional input validation and cleanup hooks. Plugins are registered explicitly.

use std::fmt;
use std::sync::OnceLock;
use async_trait::async_trait;
use regex::Regex;
use serde::{Serialize, Deserialize};
use serde_json::Value;
use super::error::PluginResult;

/// Input handed to a plugin's entry point
pub type PluginInput = serde_json::Map<String, Value>;

/// Capability interface every plugin implements
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Get plugin metadata information
    fn plugin_info(&self) -> &PluginInfo;

    /// Run the plugin against its input.
    ///
    /// The future may be dropped at any await point when the sandbox cancels the call.
    async fn execute(&self, input: PluginInput) -> PluginResult<Value>;

    /// Reject malformed input before execution starts
    fn validate(&self, _input: &PluginInput) -> PluginResult<()> {
        Ok(())
    }

    /// Release plugin resources on unload
    async fn cleanup(&self) -> PluginResult<()> {
        Ok(())
    }

    /// Plugin name (unique identifier)
    fn name(&self) -> &str {
        &self.plugin_info().name
    }
}

/// Plugin metadata and information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name (unique identifier)
    pub name: String,

    /// Plugin version
    pub version: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Names that must be constructed before this plugin
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl PluginInfo {
    /// Create a new PluginInfo
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            dependencies: Vec::new(),
        }
    }

    /// Set description
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }

    /// Add an initialization dependency
    pub fn with_dependency<S: Into<String>>(mut self, dependency: S) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Identity of this plugin
    pub fn identity(&self) -> PluginIdentity {
        PluginIdentity::new(self.name.clone(), self.version.clone())
    }
}

/// `(name, version)` pair, unique within a version cache
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginIdentity {
    pub name: String,
    pub version: String,
}

fn versioned_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<name>.+)_v(?P<number>\d+)$").expect("versioned name pattern is valid")
    })
}

fn semantic_version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\d+\.\d+\.\d+$").expect("semantic version pattern is valid")
    })
}

impl PluginIdentity {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self { name: name.into(), version: version.into() }
    }

    /// Build the cache identity for `name_v<number>`
    pub fn versioned(name: &str, number: u64) -> Self {
        Self::new(name, format!("v{}", number))
    }

    /// Split a cache name like `summarize_v3` into `("summarize", 3)`
    pub fn parse_versioned(versioned_name: &str) -> Option<(String, u64)> {
        let captures = versioned_name_pattern().captures(versioned_name)?;
        let number = captures.name("number")?.as_str().parse().ok()?;
        Some((captures.name("name")?.as_str().to_string(), number))
    }

    /// Whether the version is `major.minor.patch`
    pub fn is_semantic(&self) -> bool {
        semantic_version_pattern().is_match(&self.version)
    }

    /// Cache directory/key form: `name_vN` for numbered versions, `name@version` otherwise
    pub fn cache_key(&self) -> String {
        match self.version.strip_prefix('v') {
            Some(number) if number.chars().all(|c| c.is_ascii_digit()) && !number.is_empty() => {
                format!("{}_v{}", self.name, number)
            }
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for PluginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_versioned_name() {
        assert_eq!(PluginIdentity::parse_versioned("summarize_v3"), Some(("summarize".to_string(), 3)));
        assert_eq!(PluginIdentity::parse_versioned("text_stats_v12"), Some(("text_stats".to_string(), 12)));
        assert_eq!(PluginIdentity::parse_versioned("summarize"), None);
        assert_eq!(PluginIdentity::parse_versioned("summarize_vx"), None);
    }

    #[test]
    fn test_semantic_versions() {
        assert!(PluginIdentity::new("a", "1.2.3").is_semantic());
        assert!(!PluginIdentity::new("a", "v2").is_semantic());
        assert!(!PluginIdentity::new("a", "1.2").is_semantic());
    }

    #[test]
    fn test_cache_key_and_display() {
        let numbered = PluginIdentity::versioned("fetch", 4);
        assert_eq!(numbered.cache_key(), "fetch_v4");
        assert_eq!(numbered.to_string(), "fetch@v4");

        let semantic = PluginIdentity::new("fetch", "1.0.0");
        assert_eq!(semantic.cache_key(), "fetch@1.0.0");
    }

    #[test]
    fn test_plugin_info_builder() {
        let info = PluginInfo::new("alpha", "1.0.0")
            .with_description("first")
            .with_dependency("beta");
        assert_eq!(info.dependencies, vec!["beta".to_string()]);
        assert_eq!(info.identity(), PluginIdentity::new("alpha", "1.0.0"));
    }
}
