//! Host context shared by every component of the plugin core.
//!
//! Constructed once at startup and handed to [`crate::PluginManager`]. It
//! replaces ad-hoc lookups on a global application object: directory
//! layout, configuration store, resource monitor and named services all
//! live here.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::config::ConfigStore;
use crate::monitor::ResourceMonitor;
use crate::{PluginError, Result};

/// A host service handed to plugins by name.
pub type Service = Arc<dyn Any + Send + Sync>;

/// Service name of the configuration store (`Arc<dyn ConfigStore>`).
pub const CONFIG_SERVICE: &str = "config_manager";

/// Service name of the resource monitor (`ResourceMonitor`).
pub const MONITOR_SERVICE: &str = "system_monitor";

/// Environment variable overriding the host home directory.
pub const HOME_ENV: &str = "IRINTAI_HOME";

/// Directory layout used by the plugin core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPaths {
    /// One subdirectory per plugin
    pub plugin_dir: PathBuf,
    /// Root of per-plugin configuration directories
    pub config_dir: PathBuf,
    /// Root of per-plugin data directories
    pub data_dir: PathBuf,
    /// Read-only resources shared by all plugins
    #[serde(default)]
    pub shared_dir: Option<PathBuf>,
}

impl HostPaths {
    /// Standard layout below `root`.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            plugin_dir: root.join("plugins"),
            config_dir: root.join("data").join("plugins").join("config"),
            data_dir: root.join("data").join("plugins").join("data"),
            shared_dir: Some(root.join("resources").join("shared")),
        }
    }

    /// Directory of an installed plugin.
    ///
    /// Fails with [`PluginError::NotFound`] unless `plugin_id` is a single
    /// plain path component.
    pub fn plugin_path(&self, plugin_id: &str) -> Result<PathBuf> {
        Ok(self.plugin_dir.join(check_plugin_id(plugin_id)?))
    }

    pub fn plugin_config_dir(&self, plugin_id: &str) -> Result<PathBuf> {
        Ok(self.config_dir.join(check_plugin_id(plugin_id)?))
    }

    pub fn plugin_data_dir(&self, plugin_id: &str) -> Result<PathBuf> {
        Ok(self.data_dir.join(check_plugin_id(plugin_id)?))
    }

    /// Create the root directories if missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.plugin_dir, &self.config_dir, &self.data_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::under(default_home())
    }
}

/// Whether `plugin_id` names exactly one directory entry.
///
/// Rejects empty ids, separators, `.` and `..`, so an id can never address
/// anything outside the directory it is joined onto.
pub fn is_valid_plugin_id(plugin_id: &str) -> bool {
    if plugin_id.is_empty() || plugin_id.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(plugin_id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => name == plugin_id,
        _ => false,
    }
}

pub(crate) fn check_plugin_id(plugin_id: &str) -> Result<&str> {
    if is_valid_plugin_id(plugin_id) {
        Ok(plugin_id)
    } else {
        Err(PluginError::NotFound(plugin_id.to_string()))
    }
}

/// `$IRINTAI_HOME`, else `~/.irintai`.
pub fn default_home() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|home| home.join(".irintai"))
        .unwrap_or_else(|| PathBuf::from(".irintai"))
}

/// Everything the plugin core needs from the host application.
pub struct HostContext {
    paths: HostPaths,
    config: Arc<dyn ConfigStore>,
    monitor: Arc<ResourceMonitor>,
    host_version: Version,
    services: RwLock<HashMap<String, Service>>,
}

impl HostContext {
    pub fn new(paths: HostPaths, config: Arc<dyn ConfigStore>) -> Self {
        let host_version =
            Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| Version::new(0, 0, 0));
        Self {
            paths,
            config,
            monitor: Arc::new(ResourceMonitor::new()),
            host_version,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_host_version(mut self, version: Version) -> Self {
        self.host_version = version;
        self
    }

    pub fn with_service(self, name: impl Into<String>, service: Service) -> Self {
        self.provide_service(name, service);
        self
    }

    pub fn paths(&self) -> &HostPaths {
        &self.paths
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Register a host service, replacing any previous one with that name.
    pub fn provide_service(&self, name: impl Into<String>, service: Service) {
        self.services.write().insert(name.into(), service);
    }

    /// Look up a host service. The config store and resource monitor are
    /// always available.
    pub fn service(&self, name: &str) -> Option<Service> {
        match name {
            CONFIG_SERVICE => Some(Arc::new(self.config.clone()) as Service),
            MONITOR_SERVICE => Some(self.monitor.clone() as Service),
            _ => self.services.read().get(name).cloned(),
        }
    }

    /// Names of every host service, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.push(CONFIG_SERVICE.to_string());
        names.push(MONITOR_SERVICE.to_string());
        names.sort();
        names.dedup();
        names
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("paths", &self.paths)
            .field("host_version", &self.host_version)
            .field("services", &self.service_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JsonConfigStore;

    #[test]
    fn test_layout() {
        let paths = HostPaths::under("/srv/irintai");
        assert_eq!(
            paths.plugin_path("notes").unwrap(),
            PathBuf::from("/srv/irintai/plugins/notes")
        );
        assert_eq!(
            paths.plugin_config_dir("notes").unwrap(),
            PathBuf::from("/srv/irintai/data/plugins/config/notes")
        );
        assert_eq!(
            paths.plugin_data_dir("notes").unwrap(),
            PathBuf::from("/srv/irintai/data/plugins/data/notes")
        );
    }

    #[test]
    fn test_plugin_ids_stay_inside_their_root() {
        for id in ["notes", "notes-2", "my_plugin", "v1.2", ".hidden"] {
            assert!(is_valid_plugin_id(id), "{id}");
        }
        for id in ["", ".", "..", "../etc", "a/b", "a\\b", "/abs", "notes/"] {
            assert!(!is_valid_plugin_id(id), "{id}");
        }

        let paths = HostPaths::under("/srv/irintai");
        assert!(matches!(paths.plugin_config_dir(".."), Err(PluginError::NotFound(id)) if id == ".."));
        assert!(paths.plugin_data_dir("../other").is_err());
        assert!(paths.plugin_path("").is_err());
    }

    #[test]
    fn test_builtin_services() {
        let host = HostContext::new(
            HostPaths::under("/tmp/x"),
            Arc::new(JsonConfigStore::in_memory()),
        );

        let config = host.service(CONFIG_SERVICE).unwrap();
        assert!(config.downcast_ref::<Arc<dyn ConfigStore>>().is_some());

        let monitor = host.service(MONITOR_SERVICE).unwrap();
        assert!(monitor.downcast::<ResourceMonitor>().is_ok());

        assert!(host.service("chat_engine").is_none());
        host.provide_service("chat_engine", Arc::new(String::from("engine")));
        let engine = host.service("chat_engine").unwrap();
        assert_eq!(engine.downcast_ref::<String>().unwrap(), "engine");
    }
}
