//! Plugin entry file (`plugin.toml`).
//!
//! A plugin directory is recognized by this file. It names the catalog
//! entry that builds the plugin; the directory name is used when omitted.
//!
//! ```toml
//! entry = "notes"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{PluginError, Result};

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Catalog entry name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl PluginManifest {
    /// Load the manifest of the plugin `plugin_id` from a file.
    pub fn from_file(plugin_id: &str, path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PluginError::load_error(plugin_id, format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::parse(plugin_id, &content)
    }

    /// Parse manifest from a TOML string.
    pub fn parse(plugin_id: &str, content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content).map_err(|e| {
            PluginError::load_error(plugin_id, format!("Failed to parse TOML: {e}"))
        })?;
        manifest.validate(plugin_id)?;
        Ok(manifest)
    }

    /// Entry name, defaulting to the plugin id.
    pub fn entry_name<'a>(&'a self, plugin_id: &'a str) -> &'a str {
        self.entry.as_deref().unwrap_or(plugin_id)
    }

    fn validate(&self, plugin_id: &str) -> Result<()> {
        let Some(entry) = &self.entry else {
            return Ok(());
        };
        if entry.is_empty() {
            return Err(PluginError::load_error(plugin_id, "Entry name cannot be empty"));
        }
        if !entry
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(PluginError::load_error(
                plugin_id,
                "Entry name can only contain alphanumeric characters, hyphens, dots and underscores",
            ));
        }
        Ok(())
    }
}
