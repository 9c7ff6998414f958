//! Plugin loader for discovering and constructing plugins.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::PluginCatalog;
use crate::guard;
use crate::host::is_valid_plugin_id;
use crate::manifest::PluginManifest;
use crate::plugin::{PluginFactory, PluginHandle, PluginInit, PluginMetadata};
use crate::{MANIFEST_FILE, PluginError, Result};

/// A plugin directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPlugin {
    /// Plugin id (directory name)
    pub id: String,
    /// Plugin directory path
    pub path: PathBuf,
}

/// A resolved entry point, ready to construct.
#[derive(Clone)]
pub struct ResolvedPlugin {
    pub manifest: PluginManifest,
    pub factory: Arc<dyn PluginFactory>,
    pub metadata: PluginMetadata,
}

/// Finds plugin directories and turns them into instances.
pub struct PluginLoader {
    plugin_dir: PathBuf,
    catalog: Arc<PluginCatalog>,
}

impl PluginLoader {
    pub fn new(plugin_dir: impl Into<PathBuf>, catalog: Arc<PluginCatalog>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            catalog,
        }
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    /// Plugin directories below the plugin root, sorted by id. A directory
    /// counts when it holds a `plugin.toml`; hidden and `_`-prefixed names
    /// are skipped.
    pub async fn discover(&self) -> Vec<DiscoveredPlugin> {
        if tokio::fs::metadata(&self.plugin_dir).await.is_err() {
            tracing::debug!("Plugin directory does not exist: {:?}", self.plugin_dir);
            return Vec::new();
        }

        let mut plugins = match self.discover_in_path(&self.plugin_dir).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("Error discovering plugins in {:?}: {}", self.plugin_dir, e);
                Vec::new()
            }
        };
        plugins.sort_by(|a, b| a.id.cmp(&b.id));

        tracing::info!("Discovered {} plugins", plugins.len());
        plugins
    }

    async fn discover_in_path(&self, path: &Path) -> Result<Vec<DiscoveredPlugin>> {
        let mut plugins = Vec::new();
        let mut entries = tokio::fs::read_dir(path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();

            let is_dir = match entry.file_type().await {
                Ok(ft) => ft.is_dir(),
                Err(e) => {
                    tracing::warn!("Cannot inspect {:?}: {}", entry_path, e);
                    continue;
                }
            };
            if !is_dir {
                continue;
            }

            let name = entry.file_name();
            let Some(id) = name.to_str() else {
                tracing::warn!("Skipping plugin directory with non UTF-8 name: {:?}", entry_path);
                continue;
            };
            if id.starts_with('.') || id.starts_with('_') {
                continue;
            }

            if tokio::fs::metadata(entry_path.join(MANIFEST_FILE)).await.is_err() {
                tracing::debug!("No {} in {:?}, skipping", MANIFEST_FILE, entry_path);
                continue;
            }

            plugins.push(DiscoveredPlugin {
                id: id.to_string(),
                path: entry_path,
            });
        }

        Ok(plugins)
    }

    /// Read the manifest of `plugin_id` and find its factory.
    pub fn resolve(&self, plugin_id: &str) -> Result<ResolvedPlugin> {
        if !is_valid_plugin_id(plugin_id) {
            return Err(PluginError::load_error(plugin_id, "Invalid plugin id"));
        }
        let manifest_path = self.plugin_dir.join(plugin_id).join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(PluginError::load_error(
                plugin_id,
                format!("No {MANIFEST_FILE} found at {}", manifest_path.display()),
            ));
        }

        let manifest = PluginManifest::from_file(plugin_id, &manifest_path)?;
        let entry = manifest.entry_name(plugin_id).to_string();
        let factory = self.catalog.get(&entry).ok_or_else(|| {
            PluginError::load_error(plugin_id, format!("No plugin entry named '{entry}'"))
        })?;

        let metadata = guard::contain_sync(plugin_id, "metadata", || factory.metadata())
            .map_err(|e| PluginError::load_error(plugin_id, e.to_string()))?;
        metadata.validate(plugin_id)?;

        Ok(ResolvedPlugin {
            manifest,
            factory,
            metadata,
        })
    }

    /// Construct an instance through its factory and probe its
    /// capabilities. Errors and panics in the factory become load errors.
    pub fn instantiate(&self, resolved: &ResolvedPlugin, init: PluginInit) -> Result<PluginHandle> {
        let plugin_id = init.plugin_id.clone();
        let plugin = guard::contain_sync(&plugin_id, "create", || resolved.factory.create(init))
            .and_then(|created| created)
            .map_err(|e| match e {
                e @ PluginError::LoadError { .. } => e,
                other => PluginError::load_error(&plugin_id, other.to_string()),
            })?;

        let handle = guard::contain_sync(&plugin_id, "probe", || {
            PluginHandle::new(&plugin_id, plugin)
        })
        .map_err(|e| PluginError::load_error(&plugin_id, e.to_string()))?;

        tracing::debug!(
            "Constructed plugin {} with capabilities {:?}",
            plugin_id,
            handle.capabilities().names()
        );
        Ok(handle)
    }
}
