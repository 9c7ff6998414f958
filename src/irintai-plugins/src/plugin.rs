//! Core plugin types and traits.
//!
//! A plugin is a [`PluginFactory`] compiled into the host and registered in a
//! [`crate::PluginCatalog`]. The factory carries the static metadata and
//! builds a [`Plugin`] instance, which exposes its optional capabilities
//! through typed accessors instead of being probed for methods at call time.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ConfigMap, ConfigSchema};
use crate::extensions::ExtensionProvider;
use crate::sdk::PluginSdk;
use crate::updates::UpdateSource;
use crate::{PluginError, Result};

/// Lifecycle status of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    /// Discovered but not loaded
    #[default]
    NotLoaded,
    /// Load in progress
    Loading,
    /// Instance constructed, not yet activated
    Loaded,
    /// Activated and receiving events
    Active,
    /// Deactivated, instance still alive
    Inactive,
    /// A load or hook failed
    Error,
}

impl PluginStatus {
    /// Whether `activate` may run from this status.
    pub fn can_activate(self) -> bool {
        matches!(self, Self::Loaded | Self::Inactive)
    }

    /// Whether an instance exists for a plugin in this status.
    pub fn has_instance(self) -> bool {
        matches!(self, Self::Loaded | Self::Active | Self::Inactive)
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "Not Loaded"),
            Self::Loading => write!(f, "Loading..."),
            Self::Loaded => write!(f, "Loaded"),
            Self::Active => write!(f, "Active"),
            Self::Inactive => write!(f, "Inactive"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Dependencies a plugin declares in its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDependencies {
    /// Semver requirement on the host version, e.g. `>=0.3`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Executables that must be resolvable on `PATH`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_tools: Vec<String>,

    /// Other plugins that must be active first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,
}

impl PluginDependencies {
    /// Whether nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.external_tools.is_empty() && self.plugins.is_empty()
    }
}

/// Static plugin declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Human-readable name
    pub name: String,

    /// Version string (semver)
    pub version: String,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Author
    #[serde(default)]
    pub author: String,

    /// Declared dependencies
    #[serde(default, skip_serializing_if = "PluginDependencies::is_empty")]
    pub dependencies: PluginDependencies,

    /// Where to look for newer versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_url: Option<String>,

    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl PluginMetadata {
    /// Create metadata with the two required fields.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            dependencies: PluginDependencies::default(),
            update_url: None,
            tags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: PluginDependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_update_url(mut self, url: impl Into<String>) -> Self {
        self.update_url = Some(url.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Validate the declaration for plugin `id`.
    pub fn validate(&self, id: &str) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PluginError::load_error(id, "metadata is missing a name"));
        }
        if self.version.trim().is_empty() {
            return Err(PluginError::load_error(id, "metadata is missing a version"));
        }
        Ok(())
    }
}

/// Result of a lifecycle or configuration hook that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// The plugin accepted the transition.
    Accepted,
    /// The plugin is not ready; the transition does not happen.
    Declined(Option<String>),
}

impl HookOutcome {
    pub fn declined(reason: impl Into<String>) -> Self {
        Self::Declined(Some(reason.into()))
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl From<bool> for HookOutcome {
    fn from(accepted: bool) -> Self {
        if accepted {
            Self::Accepted
        } else {
            Self::Declined(None)
        }
    }
}

bitflags! {
    /// Optional capabilities a plugin instance offers, probed once at load.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        const LIFECYCLE = 1 << 0;
        const CONFIGURABLE = 1 << 1;
        const ACTIONS = 1 << 2;
        const EXTENSIONS = 1 << 3;
        const UPDATES = 1 << 4;
    }
}

impl Capabilities {
    /// Probe a plugin instance.
    pub fn probe(plugin: &dyn Plugin) -> Self {
        let mut caps = Self::empty();
        caps.set(Self::LIFECYCLE, plugin.lifecycle().is_some());
        caps.set(Self::CONFIGURABLE, plugin.configurable().is_some());
        caps.set(Self::ACTIONS, plugin.actions().is_some());
        caps.set(Self::EXTENSIONS, plugin.extensions().is_some());
        caps.set(Self::UPDATES, plugin.updates().is_some());
        caps
    }

    /// Lowercase capability names, for display.
    pub fn names(&self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}

/// A constructed plugin.
///
/// All methods take `&self`; a plugin that keeps mutable state uses its own
/// interior mutability. This lets one plugin call into another while both
/// are being driven by the host.
pub trait Plugin: Send + Sync {
    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        None
    }

    fn configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    fn actions(&self) -> Option<&dyn ActionProvider> {
        None
    }

    fn extensions(&self) -> Option<&dyn ExtensionProvider> {
        None
    }

    fn updates(&self) -> Option<&dyn UpdateSource> {
        None
    }
}

/// Activation, deactivation and uninstall hooks.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Called when the plugin goes to `Active`.
    async fn activate(&self) -> Result<HookOutcome> {
        Ok(HookOutcome::Accepted)
    }

    /// Called when the plugin leaves `Active`.
    async fn deactivate(&self) -> Result<HookOutcome> {
        Ok(HookOutcome::Accepted)
    }

    /// Called before the plugin's files and descriptor are removed.
    async fn uninstall(&self) -> Result<()> {
        Ok(())
    }
}

/// Runtime configuration support.
#[async_trait]
pub trait Configurable: Send + Sync {
    /// Apply new configuration values.
    async fn update_configuration(&self, values: &ConfigMap) -> Result<HookOutcome>;

    /// Defaults used when no stored configuration exists.
    fn default_config(&self) -> ConfigMap {
        ConfigMap::new()
    }

    /// Schema computed by the instance.
    fn config_schema(&self) -> Option<ConfigSchema> {
        None
    }
}

/// Named methods other plugins and the host may invoke.
#[async_trait]
pub trait ActionProvider: Send + Sync {
    /// Names of the available actions.
    fn action_names(&self) -> Vec<String>;

    /// Invoke an action by name.
    async fn invoke(&self, action: &str, args: Vec<Value>) -> Result<Value>;

    fn has_action(&self, action: &str) -> bool {
        self.action_names().iter().any(|name| name == action)
    }
}

/// Everything a factory receives to construct an instance.
pub struct PluginInit {
    /// Plugin identifier (directory name)
    pub plugin_id: String,
    /// Capability bundle
    pub sdk: PluginSdk,
    /// Per-plugin configuration directory
    pub config_path: PathBuf,
    /// Span to log under
    pub span: tracing::Span,
}

/// Compiled-in entry point for one plugin.
pub trait PluginFactory: Send + Sync {
    /// Static declaration.
    fn metadata(&self) -> PluginMetadata;

    /// Static configuration schema.
    fn config_schema(&self) -> Option<ConfigSchema> {
        None
    }

    /// Construct a plugin instance.
    fn create(&self, init: PluginInit) -> Result<Arc<dyn Plugin>>;
}

/// A live plugin instance plus the capabilities probed at load.
#[derive(Clone)]
pub struct PluginHandle {
    id: String,
    plugin: Arc<dyn Plugin>,
    capabilities: Capabilities,
}

impl PluginHandle {
    pub fn new(id: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        let capabilities = Capabilities::probe(plugin.as_ref());
        Self {
            id: id.into(),
            plugin,
            capabilities,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    pub fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        if self.capabilities.contains(Capabilities::LIFECYCLE) {
            self.plugin.lifecycle()
        } else {
            None
        }
    }

    pub fn configurable(&self) -> Option<&dyn Configurable> {
        if self.capabilities.contains(Capabilities::CONFIGURABLE) {
            self.plugin.configurable()
        } else {
            None
        }
    }

    pub fn actions(&self) -> Option<&dyn ActionProvider> {
        if self.capabilities.contains(Capabilities::ACTIONS) {
            self.plugin.actions()
        } else {
            None
        }
    }

    pub fn extensions(&self) -> Option<&dyn ExtensionProvider> {
        if self.capabilities.contains(Capabilities::EXTENSIONS) {
            self.plugin.extensions()
        } else {
            None
        }
    }

    pub fn updates(&self) -> Option<&dyn UpdateSource> {
        if self.capabilities.contains(Capabilities::UPDATES) {
            self.plugin.updates()
        } else {
            None
        }
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Summary row for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub status: PluginStatus,
    pub version: String,
    pub description: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
