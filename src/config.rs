use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use toml::Value;
use log::{debug, info};
use crate::cache::CacheConfig;
use crate::logging::{LogConfig, LogDestination, LogFormat};
use crate::sandbox::SandboxConfig;
use crate::trust::{TrustConfig, TrustDelta};
use crate::units::{parse_duration, parse_memory_mb};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "PLUGIN_RUNTIME_CONFIG";

/// Configuration storage - section_name -> key -> value
pub type Configuration = HashMap<String, HashMap<String, String>>;

/// Every runtime setting, one field per configuration section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub sandbox: SandboxConfig,
    pub trust: TrustConfig,
    pub cache: CacheConfig,
    pub logging: LogConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate().context("Invalid [sandbox] configuration")?;
        self.trust.validate().context("Invalid [trust] configuration")?;
        self.cache.validate().context("Invalid [cache] configuration")?;
        self.logging.validate().context("Invalid [logging] configuration")?;
        Ok(())
    }
}

/// Configuration manager
pub struct ConfigManager {
    config: Configuration,
    config_file_path: Option<PathBuf>,
    selected_section: Option<String>,
}

impl ConfigManager {
    /// Create a new ConfigManager from a Configuration (primarily for testing)
    pub fn from_config(config: Configuration) -> Self {
        Self {
            config,
            config_file_path: None,
            selected_section: None,
        }
    }

    /// Load configuration using discovery hierarchy
    pub fn load() -> Result<Self> {
        debug!("Starting configuration discovery");

        for path in discover_config_files() {
            debug!("Attempting to load config from: {}", path.display());
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        info!("No configuration file found, using defaults");
        Ok(Self::from_config(Configuration::new()))
    }

    /// Load configuration from explicit file path
    pub fn load_from_file(path: PathBuf) -> Result<Self> {
        debug!("Loading configuration from file: {}", path.display());

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = parse_toml_config(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        info!("Loaded configuration from: {}", path.display());
        Ok(Self {
            config,
            config_file_path: Some(path),
            selected_section: None,
        })
    }

    pub fn config_file_path(&self) -> Option<&PathBuf> {
        self.config_file_path.as_ref()
    }

    /// Get value from configuration with section fallback
    pub fn get_value(&self, section: &str, key: &str) -> Option<&String> {
        // Priority: selected_section -> specified section -> base
        if let Some(selected) = &self.selected_section {
            if let Some(value) = self.config.get(selected).and_then(|s| s.get(key)) {
                return Some(value);
            }
        }

        if let Some(value) = self.config.get(section).and_then(|s| s.get(key)) {
            return Some(value);
        }

        self.config.get("base").and_then(|s| s.get(key))
    }

    /// Select a named profile section that overrides every other section
    pub fn select_section(&mut self, section: String) {
        debug!("Selecting configuration section: {}", section);
        self.selected_section = Some(section);
    }

    /// Get boolean value with type conversion
    pub fn get_bool(&self, section: &str, key: &str) -> Result<Option<bool>> {
        match self.get_value(section, key) {
            Some(value) => match value.to_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(anyhow::anyhow!("Invalid boolean value for {}.{}: {}", section, key, value)),
            },
            None => Ok(None),
        }
    }

    /// Get log level value with type conversion
    pub fn get_log_level(&self, section: &str, key: &str) -> Result<Option<log::LevelFilter>> {
        match self.get_value(section, key) {
            Some(value) => Ok(Some(crate::logging::parse_log_level(value)?)),
            None => Ok(None),
        }
    }

    /// Get path value with type conversion
    pub fn get_path(&self, section: &str, key: &str) -> Option<PathBuf> {
        self.get_value(section, key).map(PathBuf::from)
    }

    fn get_parsed<T>(&self, section: &str, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        self.get_value(section, key)
            .map(|value| value.parse::<T>()
                .with_context(|| format!("Invalid {} value in config: {}", key, value)))
            .transpose()
    }

    fn get_duration(&self, section: &str, key: &str) -> Result<Option<std::time::Duration>> {
        self.get_value(section, key)
            .map(|value| parse_duration(value)
                .with_context(|| format!("Invalid {} value in config: {}", key, value)))
            .transpose()
    }

    fn get_delta(&self, section: &str, key: &str) -> Result<Option<TrustDelta>> {
        self.get_value(section, key)
            .map(|value| parse_delta(value)
                .with_context(|| format!("Invalid {} value in config: {}", key, value)))
            .transpose()
    }

    /// Get sandbox configuration from the `[sandbox]` section
    pub fn get_sandbox_config(&self) -> Result<SandboxConfig> {
        let mut config = SandboxConfig::default();

        if let Some(timeout) = self.get_duration("sandbox", "timeout")? {
            config.timeout = timeout;
        }
        if let Some(limit) = self.get_value("sandbox", "memory-limit") {
            config.memory_limit_mb = parse_memory_mb(limit)
                .with_context(|| format!("Invalid memory-limit value in config: {}", limit))?;
        }
        if let Some(interval) = self.get_duration("sandbox", "sample-interval")? {
            config.sample_interval = interval;
        }
        if let Some(enabled) = self.get_bool("sandbox", "execution-log")? {
            if !enabled {
                config.execution_log_dir = None;
            }
        }
        if let Some(dir) = self.get_path("sandbox", "execution-log-dir") {
            config.execution_log_dir = Some(dir);
        }

        config.validate()
            .with_context(|| "Sandbox configuration validation failed")?;
        Ok(config)
    }

    /// Get trust configuration from the `[trust]` section
    pub fn get_trust_config(&self) -> Result<TrustConfig> {
        let mut config = TrustConfig::default();

        let floats: [(&str, &mut f64); 7] = [
            ("decay-factor", &mut config.decay_factor),
            ("min-trust", &mut config.min_trust),
            ("max-trust", &mut config.max_trust),
            ("reliability-weight", &mut config.reliability_weight),
            ("performance-weight", &mut config.performance_weight),
            ("security-weight", &mut config.security_weight),
            ("adaptation-threshold", &mut config.adaptation_threshold),
        ];
        for (key, field) in floats {
            if let Some(value) = self.get_parsed::<f64>("trust", key)? {
                *field = value;
            }
        }
        if let Some(max_history) = self.get_parsed::<usize>("trust", "max-history")? {
            config.max_history = max_history;
        }

        let deltas = [
            ("success-delta", &mut config.outcome_deltas.success),
            ("error-delta", &mut config.outcome_deltas.error),
            ("timeout-delta", &mut config.outcome_deltas.timeout),
            ("memory-limit-delta", &mut config.outcome_deltas.memory_limit),
        ];
        for (key, field) in deltas {
            if let Some(delta) = self.get_delta("trust", key)? {
                *field = delta;
            }
        }

        config.validate()
            .with_context(|| "Trust configuration validation failed")?;
        Ok(config)
    }

    /// Get version cache configuration from the `[cache]` section
    pub fn get_cache_config(&self) -> Result<CacheConfig> {
        let mut config = CacheConfig::default();

        if let Some(root) = self.get_path("cache", "root") {
            config.root = root;
        }
        if let Some(max_versions) = self.get_parsed::<usize>("cache", "max-versions")? {
            config.max_versions = max_versions;
        }
        if let Some(threshold) = self.get_duration("cache", "unused-threshold")? {
            config.unused_threshold = threshold;
        }
        if let Some(rate) = self.get_parsed::<f64>("cache", "min-success-rate")? {
            config.min_success_rate = rate;
        }

        config.validate()
            .with_context(|| "Cache configuration validation failed")?;
        Ok(config)
    }

    /// Get logging configuration from the `[logging]` section
    ///
    /// A `log-file` without a `file-level` logs to the file at the console level.
    pub fn get_log_config(&self) -> Result<LogConfig> {
        let mut config = LogConfig::default();

        if let Some(level) = self.get_log_level("logging", "console-level")? {
            config.console_level = level;
        }
        if let Some(format) = self.get_value("logging", "log-format") {
            config.format = format.parse::<LogFormat>().map_err(anyhow::Error::msg)?;
        }
        config.file_level = self.get_log_level("logging", "file-level")?;
        if let Some(path) = self.get_path("logging", "log-file") {
            let console_too = self.get_bool("logging", "console")?.unwrap_or(true);
            config.destination = if console_too {
                LogDestination::Both(path)
            } else {
                LogDestination::File(path)
            };
            config.file_level.get_or_insert(config.console_level);
        }

        config.validate()
            .with_context(|| "Logging configuration validation failed")?;
        Ok(config)
    }

    /// Every section at once
    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        Ok(RuntimeConfig {
            sandbox: self.get_sandbox_config()?,
            trust: self.get_trust_config()?,
            cache: self.get_cache_config()?,
            logging: self.get_log_config()?,
        })
    }
}

/// Discover configuration files in order of precedence
fn discover_config_files() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. Environment variable
    if let Ok(env_path) = env::var(CONFIG_ENV_VAR) {
        paths.push(PathBuf::from(env_path));
    }

    // 2. XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("plugin-runtime").join("config.toml"));
    }

    // 3. Home directory
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".plugin-runtime.toml"));
    }

    // 4. Project local
    paths.push(PathBuf::from("./.plugin-runtime.toml"));

    debug!("Config discovery paths: {:?}", paths);
    paths
}

/// Parse TOML content to string-based configuration
fn parse_toml_config(content: &str) -> Result<Configuration> {
    let toml_value: Value = content.parse()
        .context("Failed to parse TOML content")?;

    let mut config = Configuration::new();

    if let Value::Table(table) = toml_value {
        flatten_toml_table(&table, String::new(), &mut config);
    }

    debug!("Parsed configuration: {:?}", config);
    Ok(config)
}

/// Recursively flatten TOML tables into section.subsection format
fn flatten_toml_table(table: &toml::Table, prefix: String, config: &mut Configuration) {
    for (key, value) in table {
        let section_name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };

        match value {
            Value::Table(subtable) => {
                if subtable.values().all(|v| !matches!(v, Value::Table(_))) {
                    // Leaf table: a configuration section
                    let section_map = subtable.iter()
                        .map(|(subkey, subvalue)| (subkey.clone(), toml_value_to_string(subvalue)))
                        .collect();
                    config.insert(section_name, section_map);
                } else {
                    flatten_toml_table(subtable, section_name, config);
                }
            }
            _ => {
                // Top-level scalar
                let mut section_map = HashMap::new();
                section_map.insert("value".to_string(), toml_value_to_string(value));
                config.insert(section_name, section_map);
            }
        }
    }
}

/// Convert TOML Value to string representation
fn toml_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Array(_) | Value::Table(_) => value.to_string(),
        Value::Datetime(dt) => dt.to_string(),
    }
}

/// Parse a `[reliability, performance, security]` triple
fn parse_delta(value: &str) -> Result<TrustDelta> {
    let inner = value.trim()
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(|| anyhow::anyhow!("expected [reliability, performance, security]"))?;

    let parts = inner.split(',')
        .map(|part| part.trim().parse::<f64>().with_context(|| format!("not a number: {}", part.trim())))
        .collect::<Result<Vec<f64>>>()?;

    match parts.as_slice() {
        [reliability, performance, security] => Ok(TrustDelta::new(*reliability, *performance, *security)),
        _ => Err(anyhow::anyhow!("expected exactly three components, got {}", parts.len())),
    }
}
