//! Descriptor store: what the host knows about each plugin.
//!
//! Reads never wait on a lifecycle transition; the store has its own
//! short-lived lock and is never held across an `.await`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::plugin::{Capabilities, PluginInfo, PluginMetadata, PluginStatus};

/// Identity, status and metadata of one plugin.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Plugin identifier (directory name)
    pub id: String,
    /// Current lifecycle status
    pub status: PluginStatus,
    /// Declaration recorded at load
    pub metadata: Option<PluginMetadata>,
    /// Plugin directory
    pub path: PathBuf,
    /// Capabilities probed at load
    pub capabilities: Capabilities,
    /// Message of the most recent failure
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginDescriptor {
    fn new(id: &str, path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            status: PluginStatus::NotLoaded,
            metadata: None,
            path,
            capabilities: Capabilities::empty(),
            last_error: None,
            discovered_at: now,
            updated_at: now,
        }
    }

    /// Summary row for listings.
    pub fn info(&self) -> PluginInfo {
        let (name, version, description, author) = match &self.metadata {
            Some(meta) => (
                meta.name.clone(),
                meta.version.clone(),
                meta.description.clone(),
                meta.author.clone(),
            ),
            None => (self.id.clone(), String::new(), String::new(), String::new()),
        };

        PluginInfo {
            id: self.id.clone(),
            name,
            status: self.status,
            version,
            description,
            author,
            capabilities: self.capabilities.names(),
            last_error: self.last_error.clone(),
        }
    }
}

/// In-memory registry of plugin descriptors.
#[derive(Debug, Default)]
pub struct DescriptorStore {
    descriptors: RwLock<HashMap<String, PluginDescriptor>>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovered plugin. Returns `false` if it was already known.
    pub fn insert_discovered(&self, id: &str, path: &Path) -> bool {
        let mut descriptors = self.descriptors.write();
        if descriptors.contains_key(id) {
            return false;
        }
        descriptors.insert(id.to_string(), PluginDescriptor::new(id, path.to_path_buf()));
        true
    }

    /// Make sure a descriptor exists so a failure can be recorded on it.
    pub fn ensure(&self, id: &str, path: &Path) {
        self.insert_discovered(id, path);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.descriptors.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<PluginDescriptor> {
        self.descriptors.read().get(id).cloned()
    }

    /// Status of a plugin; unknown ids read as `NotLoaded`.
    pub fn status(&self, id: &str) -> PluginStatus {
        self.descriptors
            .read()
            .get(id)
            .map(|d| d.status)
            .unwrap_or_default()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.status(id) == PluginStatus::Active
    }

    pub fn metadata(&self, id: &str) -> Option<PluginMetadata> {
        self.descriptors
            .read()
            .get(id)
            .and_then(|d| d.metadata.clone())
    }

    pub fn path(&self, id: &str) -> Option<PathBuf> {
        self.descriptors.read().get(id).map(|d| d.path.clone())
    }

    /// Set the status of a known plugin. Clears the last error unless the
    /// new status is `Error`.
    pub fn set_status(&self, id: &str, status: PluginStatus) {
        self.update(id, |d| {
            d.status = status;
            if status != PluginStatus::Error {
                d.last_error = None;
            }
        });
    }

    /// Move a plugin to `Error` and remember why.
    pub fn set_error(&self, id: &str, message: impl Into<String>) {
        let message = message.into();
        self.update(id, move |d| {
            d.status = PluginStatus::Error;
            d.last_error = Some(message);
        });
    }

    /// Record a successful load.
    pub fn set_loaded(&self, id: &str, metadata: PluginMetadata, capabilities: Capabilities) {
        self.update(id, move |d| {
            d.status = PluginStatus::Loaded;
            d.metadata = Some(metadata);
            d.capabilities = capabilities;
            d.last_error = None;
        });
    }

    /// Record metadata read before construction.
    pub fn set_metadata(&self, id: &str, metadata: PluginMetadata) {
        self.update(id, move |d| d.metadata = Some(metadata));
    }

    /// Forget the instance-level data after unload. The declaration is kept
    /// so listings still show name and version.
    pub fn set_unloaded(&self, id: &str) {
        self.update(id, |d| {
            d.status = PluginStatus::NotLoaded;
            d.capabilities = Capabilities::empty();
            d.last_error = None;
        });
    }

    pub fn remove(&self, id: &str) -> Option<PluginDescriptor> {
        self.descriptors.write().remove(id)
    }

    /// All ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.descriptors.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids in the given status, sorted.
    pub fn ids_with_status(&self, status: PluginStatus) -> Vec<String> {
        let mut ids: Vec<_> = self
            .descriptors
            .read()
            .values()
            .filter(|d| d.status == status)
            .map(|d| d.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All descriptors, sorted by id.
    pub fn list(&self) -> Vec<PluginDescriptor> {
        let mut list: Vec<_> = self.descriptors.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut PluginDescriptor)) {
        if let Some(descriptor) = self.descriptors.write().get_mut(id) {
            f(descriptor);
            descriptor.updated_at = Utc::now();
        }
    }
}
