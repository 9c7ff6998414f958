//! Per-plugin configuration resolution and persistence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::schema::ConfigSchema;
use super::store::{ConfigStore, write_atomic};
use super::{CONFIG_FILE, ConfigMap, PLUGINS_SECTION};
use crate::host::{check_plugin_id, is_valid_plugin_id};
use crate::{PluginError, Result};

/// Reads and writes plugin settings across every storage convention the
/// host has used.
///
/// Reads try, in order: the nested `plugins.<id>` section, legacy
/// `plugins.<id>.<key>` entries, a top-level `<id>` object, then JSON files
/// next to the plugin or under the config root. Writes go to the nested
/// section, are mirrored to the legacy keys and are persisted both in the
/// store and in `<config_dir>/<id>/config.json`.
///
/// Every read-modify-write runs under one lock shared by all clones, so
/// concurrent writers never drop each other's keys.
#[derive(Clone)]
pub struct ConfigBridge {
    store: Arc<dyn ConfigStore>,
    plugin_dir: PathBuf,
    config_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ConfigBridge {
    pub fn new(store: Arc<dyn ConfigStore>, plugin_dir: PathBuf, config_dir: PathBuf) -> Self {
        Self {
            store,
            plugin_dir,
            config_dir,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Resolve a plugin's configuration, falling back to `defaults` when no
    /// stored configuration exists. Never fails; returns an empty map when
    /// nothing resolves.
    pub fn get_config(
        &self,
        plugin_id: &str,
        defaults: impl FnOnce() -> Option<ConfigMap>,
    ) -> ConfigMap {
        if let Some(config) = self.stored_config(plugin_id) {
            return config;
        }
        match defaults() {
            Some(config) if !config.is_empty() => {
                tracing::debug!("Using default configuration for plugin {}", plugin_id);
                config
            }
            _ => ConfigMap::new(),
        }
    }

    /// Configuration from the store or disk, ignoring instance defaults.
    ///
    /// A nested section that exists is authoritative even when empty.
    pub fn stored_config(&self, plugin_id: &str) -> Option<ConfigMap> {
        if !is_valid_plugin_id(plugin_id) {
            return None;
        }
        if let Some(config) = self.nested_section(plugin_id) {
            return Some(config);
        }

        let legacy = self.legacy_keys(plugin_id);
        if !legacy.is_empty() {
            tracing::debug!("Reconstructed config for {} from legacy keys", plugin_id);
            return Some(legacy);
        }

        if let Some(config) = non_empty_object(self.store.get(plugin_id)) {
            return Some(config);
        }

        self.config_file_candidates(plugin_id)
            .into_iter()
            .find_map(|path| read_json_object(&path))
    }

    /// Write a plugin's configuration and persist it.
    ///
    /// Fails only when persisting fails; whether the plugin accepts the new
    /// values is a separate concern.
    pub fn set_config(&self, plugin_id: &str, values: &ConfigMap) -> Result<()> {
        check_plugin_id(plugin_id)?;
        let _guard = self.write_lock.lock();
        self.write_config(plugin_id, values)
    }

    fn write_config(&self, plugin_id: &str, values: &ConfigMap) -> Result<()> {
        let mut plugins = match self.store.get(PLUGINS_SECTION) {
            Some(Value::Object(map)) => map,
            _ => ConfigMap::new(),
        };
        let previous = match plugins.insert(plugin_id.to_string(), Value::Object(values.clone())) {
            Some(Value::Object(previous)) => previous,
            _ => ConfigMap::new(),
        };
        self.store.set(PLUGINS_SECTION, Value::Object(plugins));

        for key in self.legacy_store_keys(plugin_id, previous.keys()) {
            let short = &key[legacy_prefix(plugin_id).len()..];
            if !values.contains_key(short) {
                self.store.remove(&key);
            }
        }
        for (key, value) in values {
            self.store.set(&legacy_key(plugin_id, key), value.clone());
        }

        self.store.save().map_err(|e| {
            PluginError::ConfigError(format!("failed to save configuration for {plugin_id}: {e}"))
        })?;

        let file = self.config_dir.join(plugin_id).join(CONFIG_FILE);
        let content = serde_json::to_vec_pretty(values)?;
        write_atomic(&file, &content).map_err(|e| {
            PluginError::ConfigError(format!("failed to write {}: {e}", file.display()))
        })?;

        tracing::info!("Saved configuration for plugin {}", plugin_id);
        Ok(())
    }

    /// Set one value, keeping the rest of the stored configuration.
    pub fn set_value(&self, plugin_id: &str, key: &str, value: Value) -> Result<()> {
        check_plugin_id(plugin_id)?;
        let _guard = self.write_lock.lock();
        let mut config = self.stored_config(plugin_id).unwrap_or_default();
        config.insert(key.to_string(), value);
        self.write_config(plugin_id, &config)
    }

    /// Fold legacy prefixed keys into the nested section. Values already in
    /// the nested section win. Returns how many keys were folded in.
    pub fn migrate_legacy(&self, plugin_id: &str) -> Result<usize> {
        check_plugin_id(plugin_id)?;
        let _guard = self.write_lock.lock();
        let legacy = self.legacy_keys(plugin_id);
        if legacy.is_empty() {
            return Ok(0);
        }

        let mut config = self.nested_section(plugin_id).unwrap_or_default();
        let mut folded = 0;
        for (key, value) in legacy {
            if !config.contains_key(&key) {
                config.insert(key, value);
                folded += 1;
            }
        }

        if folded > 0 {
            self.write_config(plugin_id, &config)?;
            tracing::info!("Migrated {} legacy keys for plugin {}", folded, plugin_id);
        }
        Ok(folded)
    }

    /// Drop every stored trace of a plugin's configuration.
    pub fn forget(&self, plugin_id: &str) -> Result<()> {
        check_plugin_id(plugin_id)?;
        let _guard = self.write_lock.lock();
        let mut previous = ConfigMap::new();
        if let Some(Value::Object(mut plugins)) = self.store.get(PLUGINS_SECTION) {
            if let Some(Value::Object(section)) = plugins.remove(plugin_id) {
                previous = section;
            }
            self.store.set(PLUGINS_SECTION, Value::Object(plugins));
        }

        for key in self.legacy_store_keys(plugin_id, previous.keys()) {
            self.store.remove(&key);
        }
        self.store.save()
    }

    /// Schema the plugin or its files declare, without inference.
    pub fn declared_schema(
        &self,
        plugin_id: &str,
        declared: Option<ConfigSchema>,
    ) -> Option<ConfigSchema> {
        if let Some(schema) = declared.filter(|s| !s.is_empty()) {
            return Some(schema);
        }
        if !is_valid_plugin_id(plugin_id) {
            return None;
        }

        self.schema_file_candidates(plugin_id)
            .into_iter()
            .find_map(|path| {
                let schema = read_schema(&path)?;
                tracing::debug!("Loaded schema for {} from {:?}", plugin_id, path);
                Some(schema)
            })
    }

    /// Schema resolution after the plugin-declared schema: files on disk,
    /// then inference from `config`.
    pub fn get_config_schema(
        &self,
        plugin_id: &str,
        declared: Option<ConfigSchema>,
        config: &ConfigMap,
    ) -> Option<ConfigSchema> {
        if let Some(schema) = self.declared_schema(plugin_id, declared) {
            return Some(schema);
        }

        let inferred = ConfigSchema::infer(config);
        if inferred.is_some() {
            tracing::debug!("Inferred schema for {} from its configuration", plugin_id);
        }
        inferred
    }

    fn nested_section(&self, plugin_id: &str) -> Option<ConfigMap> {
        match self.store.get(PLUGINS_SECTION) {
            Some(Value::Object(plugins)) => match plugins.get(plugin_id) {
                Some(Value::Object(section)) => Some(section.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Legacy entries of this plugin. Dotted suffixes are skipped since they
    /// may belong to a plugin whose id extends this one.
    fn legacy_keys(&self, plugin_id: &str) -> ConfigMap {
        let prefix = legacy_prefix(plugin_id);
        self.store
            .snapshot()
            .into_iter()
            .filter_map(|(key, value)| {
                let short = key.strip_prefix(&prefix)?;
                (!short.is_empty() && !short.contains('.')).then(|| (short.to_string(), value))
            })
            .collect()
    }

    /// Full store keys of this plugin's legacy entries plus the mirrors of
    /// `known` keys.
    fn legacy_store_keys<'a>(
        &self,
        plugin_id: &str,
        known: impl Iterator<Item = &'a String>,
    ) -> Vec<String> {
        let mut keys: Vec<String> = self
            .legacy_keys(plugin_id)
            .keys()
            .map(|short| legacy_key(plugin_id, short))
            .collect();
        for short in known {
            let key = legacy_key(plugin_id, short);
            if !keys.contains(&key) && self.store.get(&key).is_some() {
                keys.push(key);
            }
        }
        keys
    }

    fn config_file_candidates(&self, plugin_id: &str) -> [PathBuf; 3] {
        [
            self.plugin_dir.join(plugin_id).join(CONFIG_FILE),
            self.config_dir.join(format!("{plugin_id}.json")),
            self.config_dir.join(plugin_id).join(CONFIG_FILE),
        ]
    }

    fn schema_file_candidates(&self, plugin_id: &str) -> [PathBuf; 5] {
        [
            self.plugin_dir.join(plugin_id).join("config_schema.json"),
            self.plugin_dir.join(plugin_id).join("schema.json"),
            self.config_dir.join(format!("{plugin_id}_schema.json")),
            self.config_dir.join(plugin_id).join("config_schema.json"),
            self.config_dir.join(plugin_id).join("schema.json"),
        ]
    }
}

/// `plugins.<id>.<key>`
pub fn legacy_key(plugin_id: &str, key: &str) -> String {
    format!("{}{}", legacy_prefix(plugin_id), key)
}

fn legacy_prefix(plugin_id: &str) -> String {
    format!("{PLUGINS_SECTION}.{plugin_id}.")
}

fn non_empty_object(value: Option<Value>) -> Option<ConfigMap> {
    match value {
        Some(Value::Object(map)) if !map.is_empty() => Some(map),
        _ => None,
    }
}

fn read_json_object(path: &Path) -> Option<ConfigMap> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&content) {
        Ok(value) => non_empty_object(Some(value)),
        Err(e) => {
            tracing::warn!("Ignoring malformed config file {:?}: {}", path, e);
            None
        }
    }
}

fn read_schema(path: &Path) -> Option<ConfigSchema> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ConfigSchema>(&content) {
        Ok(schema) if !schema.is_empty() => Some(schema),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Ignoring malformed schema file {:?}: {}", path, e);
            None
        }
    }
}
