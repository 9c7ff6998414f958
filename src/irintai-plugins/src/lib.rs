//! # Irintai Plugin System
//!
//! Plugin manager and extension protocol for the Irintai assistant.
//!
//! ## Features
//!
//! - **Lifecycle**: discover, load, activate, deactivate, reload, unload and
//!   uninstall plugins through one state machine
//! - **Failure isolation**: errors and panics in plugin code are contained and
//!   recorded on the plugin instead of reaching the host
//! - **Event Bus**: named and wildcard events delivered to active plugins and
//!   host components, with a bounded history
//! - **Extension points**: chat, memory, log viewer and dashboard contributions
//! - **Configuration**: per-plugin settings with schemas and legacy key support
//! - **Capability bundle**: sandboxed file access, services, metrics and
//!   inter-plugin calls for plugin code
//!
//! ## Plugin Structure
//!
//! Plugins are compiled into the host and registered in a [`PluginCatalog`].
//! Each plugin directory holds an entry file naming its catalog entry:
//!
//! ```text
//! plugins/
//! └── notes/
//!     ├── plugin.toml          # entry = "notes"
//!     └── config_schema.json   # Optional schema
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use irintai_plugins::{HostContext, HostPaths, JsonConfigStore, PluginCatalog, PluginManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let paths = HostPaths::default();
//!     let store = JsonConfigStore::open(paths.config_dir.join("host.json"))?;
//!     let host = Arc::new(HostContext::new(paths, Arc::new(store)));
//!
//!     let catalog = PluginCatalog::new().with("notes", Arc::new(NotesFactory));
//!     let manager = PluginManager::new(host, Arc::new(catalog));
//!
//!     manager.auto_load_from_config().await;
//!     for plugin in manager.plugin_info() {
//!         println!("{}: {} ({})", plugin.id, plugin.version, plugin.status);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod dependencies;
pub mod error;
pub mod events;
pub mod extensions;
pub mod guard;
pub mod host;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod monitor;
pub mod plugin;
pub mod registry;
pub mod sandbox;
pub mod sdk;
pub mod updates;

// Re-exports for convenience
pub use catalog::PluginCatalog;
pub use config::{
    ConfigBridge, ConfigField, ConfigFieldType, ConfigMap, ConfigSchema, ConfigStore,
    JsonConfigStore,
};
pub use dependencies::DependencyReport;
pub use error::{PluginError, Result};
pub use events::{
    EventBus, EventHandler, EventOwner, EventPayload, EventRecord, HandlerOutcome, HostEvent,
    SubscriptionId, handler_fn, matches_pattern,
};
pub use extensions::{
    ChatUiExtension, DashboardExtension, ExtensionProvider, ExtensionRegistry,
    LogViewerExtensions, MemoryExtensions, UiComponent,
};
pub use host::{HostContext, HostPaths, Service};
pub use loader::PluginLoader;
pub use manager::PluginManager;
pub use manifest::PluginManifest;
pub use monitor::{MetricFormat, MetricMetadata, ResourceMonitor};
pub use plugin::{
    ActionProvider, Capabilities, Configurable, HookOutcome, Lifecycle, Plugin,
    PluginDependencies, PluginFactory, PluginHandle, PluginInfo, PluginInit, PluginMetadata,
    PluginStatus,
};
pub use registry::{DescriptorStore, PluginDescriptor};
pub use sandbox::SandboxedFileOps;
pub use sdk::PluginSdk;
pub use updates::{UpdateInfo, UpdateSource};

/// Plugin system version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Plugin entry filename
pub const MANIFEST_FILE: &str = "plugin.toml";
