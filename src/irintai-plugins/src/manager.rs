//! Plugin manager - the main interface for the plugin system.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::catalog::PluginCatalog;
use crate::config::{AUTOLOAD_KEY, ConfigBridge, ConfigMap, ConfigSchema};
use crate::dependencies::{self, DependencyReport};
use crate::events::{
    EventBus, EventHandler, EventOwner, EventPayload, HandlerOutcome, HostEvent, SubscriptionId,
};
use crate::extensions::ExtensionRegistry;
use crate::guard;
use crate::host::{HostContext, Service};
use crate::loader::PluginLoader;
use crate::plugin::{
    HookOutcome, PluginFactory, PluginHandle, PluginInfo, PluginInit, PluginMetadata, PluginStatus,
};
use crate::registry::{DescriptorStore, PluginDescriptor};
use crate::sandbox::SandboxedFileOps;
use crate::sdk::PluginSdk;
use crate::updates::{UpdateChecker, UpdateInfo};
use crate::{PluginError, Result};

/// State shared between the manager and the capability bundles it hands
/// out. Bundles only hold a `Weak` to it.
pub(crate) struct Shared {
    host: Arc<HostContext>,
    descriptors: Arc<DescriptorStore>,
    instances: RwLock<HashMap<String, PluginHandle>>,
    factories: RwLock<HashMap<String, Arc<dyn PluginFactory>>>,
    events: EventBus,
    extensions: ExtensionRegistry,
    bridge: ConfigBridge,
    services: RwLock<HashMap<String, Service>>,
}

impl Shared {
    pub(crate) fn host(&self) -> &HostContext {
        &self.host
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub(crate) fn bridge(&self) -> &ConfigBridge {
        &self.bridge
    }

    fn handle(&self, plugin_id: &str) -> Option<PluginHandle> {
        self.instances.read().get(plugin_id).cloned()
    }

    /// Manager-registered services first, then host services.
    pub(crate) fn service(&self, name: &str) -> Option<Service> {
        if let Some(service) = self.services.read().get(name) {
            return Some(service.clone());
        }
        self.host.service(name)
    }

    pub(crate) fn active_plugins(&self) -> Vec<String> {
        self.descriptors.ids_with_status(PluginStatus::Active)
    }

    /// Stored configuration, else the live instance's defaults.
    pub(crate) fn plugin_config(&self, plugin_id: &str) -> ConfigMap {
        self.bridge.get_config(plugin_id, || self.instance_defaults(plugin_id))
    }

    fn instance_defaults(&self, plugin_id: &str) -> Option<ConfigMap> {
        let handle = self.handle(plugin_id)?;
        let configurable = handle.configurable()?;
        guard::contain_sync(plugin_id, "default_config", || configurable.default_config()).ok()
    }

    pub(crate) async fn call_plugin_method(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let handle = self
            .handle(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        let actions = handle
            .actions()
            .ok_or_else(|| PluginError::method_not_found(plugin_id, method))?;

        if !guard::contain_sync(plugin_id, "action_names", || actions.has_action(method))? {
            return Err(PluginError::method_not_found(plugin_id, method));
        }

        guard::contain(plugin_id, method, actions.invoke(method, args))
            .await
            .map_err(|e| match e {
                e @ (PluginError::Panicked { .. } | PluginError::ActionFailed { .. }) => e,
                other => PluginError::action_failed(plugin_id, method, other.to_string()),
            })
    }
}

/// Plugin manager - the main entry point for the plugin system.
///
/// The manager handles:
/// - Plugin discovery and loading
/// - Plugin lifecycle (load, activate, deactivate, unload, uninstall)
/// - Per-plugin configuration
/// - Event distribution and extension registration
///
/// Lifecycle transitions are serialized behind one async lock. Read-only
/// queries never take it, and lifecycle events are dispatched after it is
/// released so handlers may call back into the manager.
pub struct PluginManager {
    shared: Arc<Shared>,
    loader: PluginLoader,
    lifecycle: Mutex<()>,
    discovered: AtomicBool,
}

impl PluginManager {
    /// Create a new plugin manager.
    pub fn new(host: Arc<HostContext>, catalog: Arc<PluginCatalog>) -> Self {
        let paths = host.paths().clone();
        let descriptors = Arc::new(DescriptorStore::new());
        let bridge = ConfigBridge::new(
            host.config().clone(),
            paths.plugin_dir.clone(),
            paths.config_dir.clone(),
        );

        let shared = Arc::new(Shared {
            events: EventBus::new(descriptors.clone()),
            extensions: ExtensionRegistry::new(descriptors.clone()),
            instances: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            services: RwLock::new(HashMap::new()),
            descriptors,
            bridge,
            host,
        });

        Self {
            loader: PluginLoader::new(paths.plugin_dir, catalog),
            shared,
            lifecycle: Mutex::new(()),
            discovered: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.shared.host
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        self.loader.catalog()
    }

    pub fn descriptors(&self) -> &Arc<DescriptorStore> {
        &self.shared.descriptors
    }

    /// Get event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.shared.events
    }

    /// Extension points contributed by active plugins.
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.shared.extensions
    }

    pub fn config_bridge(&self) -> &ConfigBridge {
        &self.shared.bridge
    }

    // ========== Discovery and Loading ==========

    /// Scan the plugin directory and record every plugin found. Returns the
    /// ids found, sorted.
    pub async fn discover(&self) -> Vec<String> {
        let found = self.loader.discover().await;
        let mut ids = Vec::with_capacity(found.len());
        for plugin in found {
            if self.shared.descriptors.insert_discovered(&plugin.id, &plugin.path) {
                tracing::debug!("Discovered plugin {}", plugin.id);
            }
            ids.push(plugin.id);
        }
        self.discovered.store(true, Ordering::Release);
        ids
    }

    /// Load a plugin. Loading an already loaded plugin is a no-op.
    pub async fn load(&self, plugin_id: &str) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.load_locked(plugin_id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    /// Discover and load every plugin that is not loaded yet.
    pub async fn load_all(&self) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for id in self.discover().await {
            if self.status(&id) == PluginStatus::NotLoaded {
                let result = self.load(&id).await;
                results.push((id, result));
            }
        }
        results
    }

    async fn load_locked(&self, plugin_id: &str, events: &mut Vec<HostEvent>) -> Result<()> {
        if self.shared.instances.read().contains_key(plugin_id) {
            tracing::debug!("Plugin {} is already loaded", plugin_id);
            return Ok(());
        }

        let plugin_path = self
            .shared
            .host
            .paths()
            .plugin_path(plugin_id)
            .map_err(|_| PluginError::load_error(plugin_id, "Invalid plugin id"))?;
        if !self.shared.descriptors.contains(plugin_id) && !plugin_path.is_dir() {
            tracing::error!("Failed to load plugin {}: no plugin directory", plugin_id);
            return Err(PluginError::load_error(
                plugin_id,
                format!("No plugin directory at {}", plugin_path.display()),
            ));
        }
        self.shared.descriptors.ensure(plugin_id, &plugin_path);
        self.shared
            .descriptors
            .set_status(plugin_id, PluginStatus::Loading);

        match self.construct(plugin_id).await {
            Ok((handle, factory, metadata)) => {
                let capabilities = handle.capabilities();
                self.shared
                    .instances
                    .write()
                    .insert(plugin_id.to_string(), handle);
                self.shared
                    .factories
                    .write()
                    .insert(plugin_id.to_string(), factory);
                tracing::info!("Loaded plugin {} v{}", metadata.name, metadata.version);
                self.shared
                    .descriptors
                    .set_loaded(plugin_id, metadata, capabilities);
                events.push(HostEvent::PluginLoaded {
                    plugin_id: plugin_id.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to load plugin {}: {}", plugin_id, e);
                self.mark_failed(plugin_id, &e.to_string(), events);
                Err(e)
            }
        }
    }

    async fn construct(
        &self,
        plugin_id: &str,
    ) -> Result<(PluginHandle, Arc<dyn PluginFactory>, PluginMetadata)> {
        let resolved = self.loader.resolve(plugin_id)?;
        self.shared
            .descriptors
            .set_metadata(plugin_id, resolved.metadata.clone());

        let paths = self.shared.host.paths();
        let config_path = paths.plugin_config_dir(plugin_id)?;
        tokio::fs::create_dir_all(&config_path).await.map_err(|e| {
            PluginError::load_error(
                plugin_id,
                format!("cannot create {}: {e}", config_path.display()),
            )
        })?;

        let files = SandboxedFileOps::new(
            plugin_id,
            paths.plugin_data_dir(plugin_id)?,
            &config_path,
            paths.shared_dir.as_deref(),
        );
        let span = tracing::info_span!("plugin", id = %plugin_id);
        let sdk = PluginSdk::new(plugin_id, Arc::downgrade(&self.shared), files, span.clone());

        let init = PluginInit {
            plugin_id: plugin_id.to_string(),
            sdk,
            config_path,
            span,
        };
        let handle = self.loader.instantiate(&resolved, init)?;
        Ok((handle, resolved.factory, resolved.metadata))
    }

    // ========== Plugin Lifecycle ==========

    /// Activate a loaded or inactive plugin.
    pub async fn activate(&self, plugin_id: &str) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.activate_locked(plugin_id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    /// Activate every loaded or inactive plugin, dependencies first.
    pub async fn activate_all(&self) -> Vec<(String, Result<()>)> {
        let candidates: Vec<String> = self
            .shared
            .descriptors
            .list()
            .into_iter()
            .filter(|d| d.status.can_activate())
            .map(|d| d.id)
            .collect();

        let mut results = Vec::new();
        for id in self.dependency_order(&candidates) {
            let result = self.activate(&id).await;
            results.push((id, result));
        }
        results
    }

    async fn activate_locked(&self, plugin_id: &str, events: &mut Vec<HostEvent>) -> Result<()> {
        let status = self.shared.descriptors.status(plugin_id);
        match status {
            PluginStatus::Active => return Ok(()),
            PluginStatus::Loaded | PluginStatus::Inactive => {}
            other => return Err(PluginError::invalid_state("Loaded or Inactive", other)),
        }

        let handle = self.shared.handle(plugin_id).ok_or_else(|| {
            PluginError::activation_error(plugin_id, "no live instance for a loaded plugin")
        })?;

        if let Some(metadata) = self.shared.descriptors.metadata(plugin_id) {
            if !metadata.dependencies.is_empty() {
                let report = self.dependency_report(&metadata);
                if !report.is_satisfied() {
                    tracing::warn!(
                        "Plugin {} has unmet dependencies: {}",
                        plugin_id,
                        report.missing().join(", ")
                    );
                }
            }
        }

        if let Some(lifecycle) = handle.lifecycle() {
            match guard::contain(plugin_id, "activate", lifecycle.activate()).await {
                Ok(HookOutcome::Accepted) => {}
                Ok(HookOutcome::Declined(reason)) => {
                    tracing::warn!("Plugin {} declined activation", plugin_id);
                    return Err(PluginError::declined(plugin_id, "activation", reason));
                }
                Err(e) => {
                    let err = PluginError::hook_failed(plugin_id, "activate", e.to_string());
                    tracing::error!("Error activating plugin {}: {}", plugin_id, e);
                    self.shared.extensions.detach(plugin_id);
                    self.mark_failed(plugin_id, &err.to_string(), events);
                    return Err(err);
                }
            }
        }

        self.shared
            .descriptors
            .set_status(plugin_id, PluginStatus::Active);
        if let Some(provider) = handle.extensions() {
            self.shared.extensions.attach(plugin_id, provider);
        }
        tracing::info!("Activated plugin {}", plugin_id);
        events.push(HostEvent::PluginActivated {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Deactivate an active plugin.
    pub async fn deactivate(&self, plugin_id: &str) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.deactivate_locked(plugin_id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    async fn deactivate_locked(&self, plugin_id: &str, events: &mut Vec<HostEvent>) -> Result<()> {
        let status = self.shared.descriptors.status(plugin_id);
        match status {
            PluginStatus::Inactive => return Ok(()),
            PluginStatus::Active => {}
            other => return Err(PluginError::invalid_state("Active", other)),
        }

        if let Some(lifecycle) = self.shared.handle(plugin_id).as_ref().and_then(|h| h.lifecycle()) {
            match guard::contain(plugin_id, "deactivate", lifecycle.deactivate()).await {
                Ok(HookOutcome::Accepted) => {}
                Ok(HookOutcome::Declined(reason)) => {
                    tracing::warn!("Plugin {} declined deactivation", plugin_id);
                    return Err(PluginError::declined(plugin_id, "deactivation", reason));
                }
                Err(e) => {
                    let err = PluginError::hook_failed(plugin_id, "deactivate", e.to_string());
                    tracing::error!("Error deactivating plugin {}: {}", plugin_id, e);
                    self.shared.extensions.detach(plugin_id);
                    self.mark_failed(plugin_id, &err.to_string(), events);
                    return Err(err);
                }
            }
        }

        self.shared.extensions.detach(plugin_id);
        self.shared
            .descriptors
            .set_status(plugin_id, PluginStatus::Inactive);
        tracing::info!("Deactivated plugin {}", plugin_id);
        events.push(HostEvent::PluginDeactivated {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Unload a plugin, deactivating it first when active. Unloading an
    /// unknown or not loaded plugin is a no-op.
    pub async fn unload(&self, plugin_id: &str) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.unload_locked(plugin_id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    /// Unload everything, dependents before their dependencies.
    pub async fn unload_all(&self) -> Vec<(String, Result<()>)> {
        let loaded: Vec<String> = self
            .shared
            .descriptors
            .list()
            .into_iter()
            .filter(|d| d.status != PluginStatus::NotLoaded)
            .map(|d| d.id)
            .collect();

        let mut order = self.dependency_order(&loaded);
        order.reverse();

        let mut results = Vec::new();
        for id in order {
            let result = self.unload(&id).await;
            results.push((id, result));
        }
        results
    }

    async fn unload_locked(&self, plugin_id: &str, events: &mut Vec<HostEvent>) -> Result<()> {
        if !self.shared.descriptors.contains(plugin_id) {
            return Ok(());
        }

        if self.shared.descriptors.status(plugin_id) == PluginStatus::Active {
            self.deactivate_locked(plugin_id, events).await?;
        }

        let had_instance = self.release(plugin_id);
        if !had_instance && self.shared.descriptors.status(plugin_id) == PluginStatus::NotLoaded {
            return Ok(());
        }

        self.shared.descriptors.set_unloaded(plugin_id);
        tracing::info!("Unloaded plugin {}", plugin_id);
        events.push(HostEvent::PluginUnloaded {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Drop the instance and everything registered on its behalf. Returns
    /// whether an instance existed.
    fn release(&self, plugin_id: &str) -> bool {
        let had_instance = self.shared.instances.write().remove(plugin_id).is_some();
        self.shared.factories.write().remove(plugin_id);
        self.shared
            .events
            .unregister_owner(&EventOwner::plugin(plugin_id));
        self.shared.host.monitor().forget_plugin(plugin_id);
        self.shared.extensions.forget_plugin(plugin_id);
        had_instance
    }

    /// Unload and load again, reactivating if it was active. Runs as one
    /// step; the first failure stops it.
    pub async fn reload(&self, plugin_id: &str) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.reload_locked(plugin_id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    async fn reload_locked(&self, plugin_id: &str, events: &mut Vec<HostEvent>) -> Result<()> {
        let was_active = self.shared.descriptors.is_active(plugin_id);
        self.unload_locked(plugin_id, events).await?;
        self.load_locked(plugin_id, events).await?;
        if was_active {
            self.activate_locked(plugin_id, events).await?;
        }
        tracing::info!("Reloaded plugin {}", plugin_id);
        Ok(())
    }

    /// Remove a plugin: deactivate it, run its uninstall hook, delete its
    /// configuration and forget it.
    pub async fn uninstall(&self, plugin_id: &str) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.uninstall_locked(plugin_id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    async fn uninstall_locked(&self, plugin_id: &str, events: &mut Vec<HostEvent>) -> Result<()> {
        if !self.shared.descriptors.contains(plugin_id) {
            return Err(PluginError::NotFound(plugin_id.to_string()));
        }
        let config_dir = self.shared.host.paths().plugin_config_dir(plugin_id)?;

        if self.shared.descriptors.status(plugin_id) == PluginStatus::Active {
            if let Err(e) = self.deactivate_locked(plugin_id, events).await {
                tracing::error!("Cannot uninstall active plugin {}: {}", plugin_id, e);
                return Err(e);
            }
        }

        if let Some(lifecycle) = self.shared.handle(plugin_id).as_ref().and_then(|h| h.lifecycle()) {
            if let Err(e) = guard::contain(plugin_id, "uninstall", lifecycle.uninstall()).await {
                tracing::warn!("Uninstall hook of {} failed: {}", plugin_id, e);
            }
        }
        self.release(plugin_id);

        if tokio::fs::metadata(&config_dir).await.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(&config_dir).await {
                tracing::error!("Failed to uninstall {}: {}", plugin_id, e);
                self.shared.descriptors.set_unloaded(plugin_id);
                return Err(e.into());
            }
        }
        if let Err(e) = self.shared.bridge.forget(plugin_id) {
            tracing::warn!("Failed to clear stored configuration of {}: {}", plugin_id, e);
        }

        self.shared.descriptors.remove(plugin_id);
        tracing::info!("Uninstalled plugin {}", plugin_id);
        events.push(HostEvent::PluginUninstalled {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Load and activate the listed plugins in order. Failures are logged
    /// and do not stop the rest. Returns the listed ids that ended active.
    pub async fn auto_load<S: AsRef<str>>(&self, plugin_ids: &[S]) -> Vec<String> {
        if !self.discovered.load(Ordering::Acquire) {
            self.discover().await;
        }

        let mut active = Vec::new();
        for plugin_id in plugin_ids {
            let plugin_id = plugin_id.as_ref();
            let mut events = Vec::new();
            {
                let _guard = self.lifecycle.lock().await;
                if self.shared.descriptors.status(plugin_id) == PluginStatus::NotLoaded {
                    match self.load_locked(plugin_id, &mut events).await {
                        Ok(()) => {
                            if let Err(e) = self.activate_locked(plugin_id, &mut events).await {
                                tracing::warn!("Auto-load could not activate {}: {}", plugin_id, e);
                            }
                        }
                        Err(e) => tracing::warn!("Auto-load could not load {}: {}", plugin_id, e),
                    }
                }
            }
            self.publish(events).await;

            if self.shared.descriptors.is_active(plugin_id) {
                active.push(plugin_id.to_string());
            }
        }

        tracing::info!("Auto-loaded {} of {} plugins", active.len(), plugin_ids.len());
        active
    }

    /// [`Self::auto_load`] with the `autoload_plugins` list from the host
    /// configuration.
    pub async fn auto_load_from_config(&self) -> Vec<String> {
        let ids: Vec<String> = match self.shared.host.config().get(AUTOLOAD_KEY) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(other) => {
                tracing::warn!("Ignoring malformed {} setting: {}", AUTOLOAD_KEY, other);
                Vec::new()
            }
            None => Vec::new(),
        };
        self.auto_load(&ids).await
    }

    /// Record a fault the host observed in a plugin. An active plugin gets a
    /// best-effort deactivation call first.
    pub async fn report_failure(&self, plugin_id: &str, message: &str) {
        let mut events = Vec::new();
        {
            let _guard = self.lifecycle.lock().await;
            if self.shared.descriptors.contains(plugin_id) {
                if self.shared.descriptors.is_active(plugin_id) {
                    if let Some(lifecycle) =
                        self.shared.handle(plugin_id).as_ref().and_then(|h| h.lifecycle())
                    {
                        if let Err(e) =
                            guard::contain(plugin_id, "deactivate", lifecycle.deactivate()).await
                        {
                            tracing::warn!("Deactivation of failed plugin {} failed: {}", plugin_id, e);
                        }
                    }
                }
                self.shared.extensions.detach(plugin_id);
                tracing::error!("Plugin {} failed: {}", plugin_id, message);
                self.mark_failed(plugin_id, message, &mut events);
            }
        }
        self.publish(events).await;
    }

    fn mark_failed(&self, plugin_id: &str, message: &str, events: &mut Vec<HostEvent>) {
        self.shared.descriptors.set_error(plugin_id, message);
        events.push(HostEvent::PluginError {
            plugin_id: plugin_id.to_string(),
            message: message.to_string(),
        });
    }

    async fn publish(&self, events: Vec<HostEvent>) {
        for event in events {
            self.shared.events.publish(event).await;
        }
    }

    // ========== Configuration ==========

    /// Resolved configuration of a plugin.
    pub fn get_config(&self, plugin_id: &str) -> ConfigMap {
        self.shared.plugin_config(plugin_id)
    }

    /// Persist a plugin's configuration, then offer it to the plugin.
    ///
    /// Fails only when persisting fails; a plugin declining or failing the
    /// update is logged.
    pub async fn set_config(&self, plugin_id: &str, values: ConfigMap) -> Result<()> {
        let mut events = Vec::new();
        let result = {
            let _guard = self.lifecycle.lock().await;
            self.set_config_locked(plugin_id, &values, &mut events).await
        };
        self.publish(events).await;
        result
    }

    async fn set_config_locked(
        &self,
        plugin_id: &str,
        values: &ConfigMap,
        events: &mut Vec<HostEvent>,
    ) -> Result<()> {
        if !self.shared.descriptors.contains(plugin_id) {
            return Err(PluginError::NotFound(plugin_id.to_string()));
        }

        if let Some(schema) = self.get_config_schema(plugin_id) {
            for (key, problem) in schema.validate(values) {
                tracing::warn!("Config value {} of {}: {}", key, plugin_id, problem);
            }
        }

        self.shared.bridge.set_config(plugin_id, values)?;

        match self.push_configuration(plugin_id, values).await {
            Ok(()) => {}
            Err(e) => tracing::warn!("Plugin {} did not apply new configuration: {}", plugin_id, e),
        }

        events.push(HostEvent::PluginConfigured {
            plugin_id: plugin_id.to_string(),
        });
        Ok(())
    }

    /// Offer values to the plugin's configuration hook without persisting
    /// them.
    pub async fn update_configuration(&self, plugin_id: &str, values: &ConfigMap) -> Result<()> {
        if self.shared.handle(plugin_id).is_none() {
            return Err(PluginError::NotFound(plugin_id.to_string()));
        }
        self.push_configuration(plugin_id, values).await
    }

    async fn push_configuration(&self, plugin_id: &str, values: &ConfigMap) -> Result<()> {
        let Some(handle) = self.shared.handle(plugin_id) else {
            return Ok(());
        };
        let Some(configurable) = handle.configurable() else {
            return Ok(());
        };
        match guard::contain(
            plugin_id,
            "update_configuration",
            configurable.update_configuration(values),
        )
        .await
        {
            Ok(HookOutcome::Accepted) => Ok(()),
            Ok(HookOutcome::Declined(reason)) => Err(PluginError::declined(
                plugin_id,
                "configuration update",
                reason,
            )),
            Err(e) => Err(PluginError::hook_failed(
                plugin_id,
                "update_configuration",
                e.to_string(),
            )),
        }
    }

    /// Restore defaults: the instance defaults, completed with defaults of
    /// a declared or file schema for fields they lack. Inferred schemas are
    /// not consulted. Returns the values written.
    pub async fn reset_config(&self, plugin_id: &str) -> Result<ConfigMap> {
        let mut defaults = self.shared.instance_defaults(plugin_id).unwrap_or_default();
        if let Some(schema) = self.declared_config_schema(plugin_id) {
            for (key, value) in schema.defaults() {
                defaults.entry(key).or_insert(value);
            }
        }
        self.set_config(plugin_id, defaults.clone()).await?;
        tracing::info!("Reset configuration of {}", plugin_id);
        Ok(defaults)
    }

    /// Schema of a plugin's configuration: declared by the instance, then
    /// by its factory, then from files, then inferred.
    pub fn get_config_schema(&self, plugin_id: &str) -> Option<ConfigSchema> {
        if let Some(schema) = self.declared_config_schema(plugin_id) {
            return Some(schema);
        }
        let config = self.get_config(plugin_id);
        self.shared.bridge.get_config_schema(plugin_id, None, &config)
    }

    fn declared_config_schema(&self, plugin_id: &str) -> Option<ConfigSchema> {
        let from_instance = self.shared.handle(plugin_id).and_then(|handle| {
            let configurable = handle.configurable()?;
            guard::contain_sync(plugin_id, "config_schema", || configurable.config_schema())
                .ok()
                .flatten()
        });

        let declared = from_instance
            .filter(|s| !s.is_empty())
            .or_else(|| {
                let factory = self.factory_for(plugin_id)?;
                guard::contain_sync(plugin_id, "config_schema", || factory.config_schema())
                    .ok()
                    .flatten()
            });

        self.shared.bridge.declared_schema(plugin_id, declared)
    }

    /// Fold legacy `plugins.<id>.<key>` settings into the nested section.
    pub fn migrate_legacy_config(&self, plugin_id: &str) -> Result<usize> {
        self.shared.bridge.migrate_legacy(plugin_id)
    }

    fn factory_for(&self, plugin_id: &str) -> Option<Arc<dyn PluginFactory>> {
        if let Some(factory) = self.shared.factories.read().get(plugin_id) {
            return Some(factory.clone());
        }
        self.loader.resolve(plugin_id).ok().map(|r| r.factory)
    }

    // ========== Dependencies and updates ==========

    /// Check what a plugin declares it needs.
    pub fn check_dependencies(&self, plugin_id: &str) -> Result<DependencyReport> {
        let metadata = self.declared_metadata(plugin_id)?;
        Ok(self.dependency_report(&metadata))
    }

    fn dependency_report(&self, metadata: &PluginMetadata) -> DependencyReport {
        dependencies::check_dependencies(
            &metadata.dependencies,
            self.shared.host.host_version(),
            |other| {
                self.shared.instances.read().contains_key(other)
                    && self.shared.descriptors.is_active(other)
            },
        )
    }

    fn dependency_order(&self, plugin_ids: &[String]) -> Vec<String> {
        let graph: Vec<(String, Vec<String>)> = plugin_ids
            .iter()
            .map(|id| {
                let deps = self
                    .shared
                    .descriptors
                    .metadata(id)
                    .map(|m| m.dependencies.plugins)
                    .unwrap_or_default();
                (id.clone(), deps)
            })
            .collect();
        dependencies::activation_order(&graph)
    }

    /// Check a plugin's update URL for a newer version.
    pub async fn check_for_updates(&self, plugin_id: &str) -> Result<UpdateInfo> {
        let metadata = self.declared_metadata(plugin_id)?;
        let checker = UpdateChecker::new()?;
        let handle = self.shared.handle(plugin_id);
        let source = handle.as_ref().and_then(|h| h.updates());
        Ok(checker.check(plugin_id, &metadata, source).await)
    }

    fn declared_metadata(&self, plugin_id: &str) -> Result<PluginMetadata> {
        if let Some(metadata) = self.shared.descriptors.metadata(plugin_id) {
            return Ok(metadata);
        }
        self.loader
            .resolve(plugin_id)
            .map(|r| r.metadata)
            .map_err(|_| PluginError::NotFound(plugin_id.to_string()))
    }

    // ========== Services and calls ==========

    /// Make a service available to plugins. Manager services shadow host
    /// services of the same name.
    pub fn register_service(&self, name: impl Into<String>, service: Service) {
        let name = name.into();
        tracing::debug!("Registered service {}", name);
        self.shared.services.write().insert(name, service);
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.shared.service(name)
    }

    /// Invoke a named action on a loaded plugin.
    pub async fn call_plugin_method(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.shared.call_plugin_method(plugin_id, method, args).await
    }

    // ========== Events ==========

    /// Subscribe a handler on behalf of `owner`.
    pub fn register_event_handler(
        &self,
        owner: EventOwner,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.shared
            .events
            .register_event_handler(owner, event_type, handler)
    }

    pub fn unregister_event_handler(
        &self,
        owner: &EventOwner,
        event_type: &str,
        handler: Option<&Arc<dyn EventHandler>>,
    ) -> usize {
        self.shared
            .events
            .unregister_event_handler(owner, event_type, handler)
    }

    /// Dispatch an event to every eligible subscriber.
    pub async fn trigger_event(
        &self,
        event_type: &str,
        data: EventPayload,
    ) -> HashMap<String, HandlerOutcome> {
        self.shared.events.dispatch(event_type, data).await
    }

    // ========== Queries ==========

    pub fn status(&self, plugin_id: &str) -> PluginStatus {
        self.shared.descriptors.status(plugin_id)
    }

    pub fn metadata(&self, plugin_id: &str) -> Option<PluginMetadata> {
        self.shared.descriptors.metadata(plugin_id)
    }

    pub fn descriptor(&self, plugin_id: &str) -> Option<PluginDescriptor> {
        self.shared.descriptors.get(plugin_id)
    }

    pub fn descriptors_list(&self) -> Vec<PluginDescriptor> {
        self.shared.descriptors.list()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.shared.instances.read().contains_key(plugin_id)
    }

    /// Ids of active plugins, sorted.
    pub fn active_plugins(&self) -> Vec<String> {
        self.shared.active_plugins()
    }

    /// Summary of every known plugin.
    pub fn plugin_info(&self) -> Vec<PluginInfo> {
        self.shared
            .descriptors
            .list()
            .iter()
            .map(PluginDescriptor::info)
            .collect()
    }

    /// Get plugin count.
    pub fn plugin_count(&self) -> usize {
        self.shared.descriptors.len()
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugin_dir", &self.loader.plugin_dir())
            .field("plugins", &self.shared.descriptors.len())
            .field("loaded", &self.shared.instances.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JsonConfigStore;
    use crate::host::HostPaths;
    use tempfile::TempDir;

    fn manager(root: &std::path::Path) -> PluginManager {
        let host = HostContext::new(HostPaths::under(root), Arc::new(JsonConfigStore::in_memory()));
        PluginManager::new(Arc::new(host), Arc::new(PluginCatalog::new()))
    }

    #[tokio::test]
    async fn test_discover_empty() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(tmp.path());
        assert!(manager.discover().await.is_empty());
        assert_eq!(manager.plugin_count(), 0);
    }

    #[tokio::test]
    async fn test_load_unknown_records_error() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(tmp.path());

        let err = manager.load("ghost").await.unwrap_err();
        assert!(matches!(err, PluginError::LoadError { .. }));
        assert_eq!(manager.status("ghost"), PluginStatus::Error);
        assert!(manager.descriptor("ghost").unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_unload_unknown_is_noop() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(tmp.path());
        assert!(manager.unload("ghost").await.is_ok());
        assert!(manager.descriptor("ghost").is_none());
    }

    #[tokio::test]
    async fn test_uninstall_unknown() {
        let tmp = TempDir::new().unwrap();
        let manager = manager(tmp.path());
        assert!(matches!(
            manager.uninstall("ghost").await,
            Err(PluginError::NotFound(_))
        ));
    }
}
