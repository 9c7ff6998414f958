//! Plugin configuration: host store, per-plugin resolution and schemas.

mod bridge;
mod schema;
mod store;

pub use bridge::{ConfigBridge, legacy_key};
pub use schema::{ConfigField, ConfigFieldType, ConfigSchema};
pub use store::{ConfigStore, JsonConfigStore};

/// A plugin's settings.
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Store key of the nested per-plugin section.
pub const PLUGINS_SECTION: &str = "plugins";

/// Store key listing plugins to load and activate at startup.
pub const AUTOLOAD_KEY: &str = "autoload_plugins";

/// File name of a persisted plugin configuration.
pub const CONFIG_FILE: &str = "config.json";
