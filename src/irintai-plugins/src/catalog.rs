//! Compiled-in plugin entry points.
//!
//! Plugins are linked into the host and registered here by entry name.
//! The loader looks an entry up after reading a plugin's `plugin.toml`.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::plugin::PluginFactory;

/// Registry of plugin factories keyed by entry name.
#[derive(Default)]
pub struct PluginCatalog {
    factories: RwLock<IndexMap<String, Arc<dyn PluginFactory>>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A previous factory under the same entry is
    /// replaced and returned.
    pub fn register(
        &self,
        entry: impl Into<String>,
        factory: Arc<dyn PluginFactory>,
    ) -> Option<Arc<dyn PluginFactory>> {
        let entry = entry.into();
        tracing::debug!("Registering plugin entry: {}", entry);
        let previous = self.factories.write().insert(entry.clone(), factory);
        if previous.is_some() {
            tracing::warn!("Plugin entry {} was registered twice; keeping the latest", entry);
        }
        previous
    }

    /// Builder-style registration.
    pub fn with(self, entry: impl Into<String>, factory: Arc<dyn PluginFactory>) -> Self {
        self.register(entry, factory);
        self
    }

    pub fn get(&self, entry: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.read().get(entry).cloned()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.read().contains_key(entry)
    }

    pub fn entries(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("entries", &self.entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::plugin::{Plugin, PluginInit, PluginMetadata};

    struct Empty;
    impl Plugin for Empty {}

    struct EmptyFactory(&'static str);

    impl PluginFactory for EmptyFactory {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new(self.0, "1.0.0")
        }

        fn create(&self, _init: PluginInit) -> Result<Arc<dyn Plugin>> {
            Ok(Arc::new(Empty))
        }
    }

    #[test]
    fn test_register_and_replace() {
        let catalog = PluginCatalog::new().with("notes", Arc::new(EmptyFactory("Notes")));
        assert!(catalog.contains("notes"));
        assert_eq!(catalog.len(), 1);

        let previous = catalog.register("notes", Arc::new(EmptyFactory("Notes v2")));
        assert_eq!(previous.map(|f| f.metadata().name), Some("Notes".to_string()));
        assert_eq!(catalog.get("notes").map(|f| f.metadata().name), Some("Notes v2".to_string()));
        assert!(catalog.get("missing").is_none());
    }
}
