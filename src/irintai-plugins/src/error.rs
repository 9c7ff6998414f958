//! Plugin system error types.

use thiserror::Error;

/// Plugin system errors.
///
/// Every call into plugin-authored code is converted into one of these
/// variants by [`crate::guard`], so host code never observes a raw panic.
#[derive(Error, Debug)]
pub enum PluginError {
    /// Plugin not found.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Plugin exposes no action with this name.
    #[error("Plugin '{plugin}' has no method '{method}'")]
    MethodNotFound { plugin: String, method: String },

    /// Plugin load error.
    #[error("Failed to load plugin '{plugin}': {message}")]
    LoadError { plugin: String, message: String },

    /// Activation bookkeeping failed after the hook accepted.
    #[error("Failed to activate plugin '{plugin}': {message}")]
    ActivationError { plugin: String, message: String },

    /// A lifecycle hook returned a declining result without failing.
    #[error("Plugin '{plugin}' declined {operation}{}", reason_suffix(.reason))]
    Declined {
        plugin: String,
        operation: String,
        reason: Option<String>,
    },

    /// A lifecycle hook returned an error or panicked.
    #[error("Hook '{operation}' failed in '{plugin}': {message}")]
    HookFailed {
        plugin: String,
        operation: String,
        message: String,
    },

    /// A plugin action returned an error.
    #[error("Action '{action}' failed in '{plugin}': {message}")]
    ActionFailed {
        plugin: String,
        action: String,
        message: String,
    },

    /// Plugin code panicked.
    #[error("Plugin '{plugin}' panicked: {message}")]
    Panicked { plugin: String, message: String },

    /// Invalid plugin state.
    #[error("Invalid plugin state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Update check error.
    #[error("Update check failed for plugin '{plugin}': {message}")]
    UpdateError { plugin: String, message: String },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl PluginError {
    /// Create a load error.
    pub fn load_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create an activation error.
    pub fn activation_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ActivationError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a declined error.
    pub fn declined(
        plugin: impl Into<String>,
        operation: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self::Declined {
            plugin: plugin.into(),
            operation: operation.into(),
            reason,
        }
    }

    /// Create a hook failure.
    pub fn hook_failed(
        plugin: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::HookFailed {
            plugin: plugin.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an action failure.
    pub fn action_failed(
        plugin: impl Into<String>,
        action: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::ActionFailed {
            plugin: plugin.into(),
            action: action.into(),
            message: message.into(),
        }
    }

    /// Create a method-not-found error.
    pub fn method_not_found(plugin: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            plugin: plugin.into(),
            method: method.into(),
        }
    }

    /// Create an update error.
    pub fn update_error(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpdateError {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Whether the plugin declined rather than failed.
    pub fn is_declined(&self) -> bool {
        matches!(self, Self::Declined { .. })
    }
}

impl From<toml::de::Error> for PluginError {
    fn from(err: toml::de::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

/// Result type alias for plugin operations.
pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = PluginError::NotFound("weather".to_string());
        assert_eq!(err.to_string(), "Plugin not found: weather");
    }

    #[test]
    fn test_declined_display() {
        let err = PluginError::declined("notes", "activate", Some("not ready".to_string()));
        assert_eq!(err.to_string(), "Plugin 'notes' declined activate: not ready");
        assert!(err.is_declined());

        let bare = PluginError::declined("notes", "deactivate", None);
        assert_eq!(bare.to_string(), "Plugin 'notes' declined deactivate");
    }

    #[test]
    fn test_hook_failed() {
        let err = PluginError::hook_failed("my-plugin", "activate", "boom");
        assert!(err.to_string().contains("my-plugin"));
        assert!(err.to_string().contains("boom"));
        assert!(!err.is_declined());
    }

    #[test]
    fn test_manifest_parse_error_converts() {
        let parsed: std::result::Result<toml::Value, _> = toml::from_str("entry = ");
        let err: PluginError = parsed.unwrap_err().into();
        assert!(matches!(err, PluginError::SerializationError(_)));

        let io: PluginError = std::io::Error::from(std::io::ErrorKind::PermissionDenied).into();
        assert!(matches!(io, PluginError::IoError(_)));
    }
}
