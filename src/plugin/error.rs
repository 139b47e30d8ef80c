//! Plugin Runtime Error Types
//!
//! Error taxonomy shared by the resolver, lifecycle manager, sandbox and version cache.

use thiserror::Error;

/// Result type for plugin runtime operations
pub type PluginResult<T> = Result<T, PluginError>;

/// Error types for plugin runtime operations
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    /// A name was resolved or depended upon without ever being registered
    #[error("Unknown dependency: {name}")]
    UnknownDependency { name: String },

    /// Resolution revisited a name that is still being constructed
    #[error("Circular dependency detected: {path}")]
    CircularDependency { path: String },

    /// A dependency factory returned an error or produced the wrong type
    #[error("Factory for '{name}' failed: {message}")]
    FactoryFailed { name: String, message: String },

    /// Requested lifecycle transition is not legal from the current state
    #[error("Invalid transition for plugin '{plugin_id}': {from} -> {to}")]
    InvalidTransition { plugin_id: String, from: String, to: String },

    /// Plugin execution error
    #[error("Plugin execution error: {message}")]
    ExecutionFailed { message: String },

    /// Plugin rejected its input
    #[error("Invalid plugin input: {message}")]
    InvalidInput { message: String },

    /// Timeout error
    #[error("Plugin operation timed out: {message}")]
    Timeout { message: String },

    /// A sampled resource exceeded its configured ceiling
    #[error("Resource limit exceeded: {message}")]
    ResourceLimitExceeded { message: String },

    /// Plugin not found
    #[error("Plugin not found: {plugin_name}")]
    PluginNotFound { plugin_name: String },

    /// Plugin already registered
    #[error("Plugin already registered: {plugin_name}")]
    PluginAlreadyRegistered { plugin_name: String },

    /// Version cache error
    #[error("Version cache error: {message}")]
    CacheError { message: String },

    /// Configuration error
    #[error("Plugin configuration error: {message}")]
    ConfigurationError { message: String },

    /// Filesystem error
    #[error("IO error: {message}")]
    Io { message: String },
}

impl PluginError {
    /// Create an unknown dependency error
    pub fn unknown_dependency<S: Into<String>>(name: S) -> Self {
        Self::UnknownDependency { name: name.into() }
    }

    /// Create a circular dependency error from the offending resolution path
    pub fn circular_dependency<S: AsRef<str>>(path: &[S]) -> Self {
        let path = path.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(" -> ");
        Self::CircularDependency { path }
    }

    /// Create a factory failure error
    pub fn factory_failed<N: Into<String>, S: Into<String>>(name: N, message: S) -> Self {
        Self::FactoryFailed { name: name.into(), message: message.into() }
    }

    /// Create an invalid transition error
    pub fn invalid_transition<I, F, T>(plugin_id: I, from: F, to: T) -> Self
    where
        I: Into<String>,
        F: ToString,
        T: ToString,
    {
        Self::InvalidTransition {
            plugin_id: plugin_id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an execution error
    pub fn execution_failed<S: Into<String>>(message: S) -> Self {
        Self::ExecutionFailed { message: message.into() }
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout { message: message.into() }
    }

    /// Create a resource limit error
    pub fn resource_limit_exceeded<S: Into<String>>(message: S) -> Self {
        Self::ResourceLimitExceeded { message: message.into() }
    }

    /// Create a plugin not found error
    pub fn plugin_not_found<S: Into<String>>(plugin_name: S) -> Self {
        Self::PluginNotFound { plugin_name: plugin_name.into() }
    }

    /// Create a plugin already registered error
    pub fn plugin_already_registered<S: Into<String>>(plugin_name: S) -> Self {
        Self::PluginAlreadyRegistered { plugin_name: plugin_name.into() }
    }

    /// Create a cache error
    pub fn cache_error<S: Into<String>>(message: S) -> Self {
        Self::CacheError { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration_error<S: Into<String>>(message: S) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Dependency graph problems, fatal to bootstrap and never retried
    pub fn is_dependency_error(&self) -> bool {
        matches!(self,
            PluginError::UnknownDependency { .. } |
            PluginError::CircularDependency { .. } |
            PluginError::FactoryFailed { .. }
        )
    }

    /// Check if error is related to plugin lifecycle
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(self,
            PluginError::InvalidTransition { .. } |
            PluginError::PluginNotFound { .. } |
            PluginError::PluginAlreadyRegistered { .. }
        )
    }

    /// Failures that originate inside a single plugin invocation
    pub fn is_execution_failure(&self) -> bool {
        matches!(self,
            PluginError::ExecutionFailed { .. } |
            PluginError::InvalidInput { .. } |
            PluginError::Timeout { .. } |
            PluginError::ResourceLimitExceeded { .. }
        )
    }

    /// Check if a caller may reasonably retry the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(self,
            PluginError::ExecutionFailed { .. } |
            PluginError::Timeout { .. } |
            PluginError::ResourceLimitExceeded { .. } |
            PluginError::Io { .. }
        )
    }
}

impl From<std::io::Error> for PluginError {
    fn from(err: std::io::Error) -> Self {
        PluginError::io(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        PluginError::cache_error(format!("JSON error: {}", err))
    }
}

impl From<tokio::task::JoinError> for PluginError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            PluginError::execution_failed(format!("Plugin task panicked: {}", err))
        } else {
            PluginError::execution_failed(format!("Plugin task cancelled: {}", err))
        }
    }
}
