//! Capability bundle handed to every plugin.
//!
//! [`PluginSdk`] is the only way a plugin reaches into the host. It holds a
//! weak reference to the manager's state, so a plugin that keeps its bundle
//! around never keeps the manager alive. Once the manager is gone, every
//! call degrades to its empty result.
//!
//! ```rust,ignore
//! struct Notes { sdk: PluginSdk }
//!
//! impl PluginFactory for NotesFactory {
//!     fn metadata(&self) -> PluginMetadata {
//!         PluginMetadata::new("Notes", "1.0.0").with_author("Irintai Team")
//!     }
//!
//!     fn create(&self, init: PluginInit) -> Result<Arc<dyn Plugin>> {
//!         init.sdk.register_event_handler("chat_message", handler_fn(|_, data| async move {
//!             Ok(data.get("text").cloned().unwrap_or_default())
//!         }));
//!         Ok(Arc::new(Notes { sdk: init.sdk }))
//!     }
//! }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ConfigMap;
use crate::events::{EventHandler, EventOwner, EventPayload, HandlerOutcome, SubscriptionId};
use crate::extensions::ModelHook;
use crate::host::Service;
use crate::manager::Shared;
use crate::monitor::{MetricGetter, MetricMetadata, ProcessSample, SystemStats};
use crate::sandbox::SandboxedFileOps;

/// Default file used by [`PluginSdk::save_data`] and [`PluginSdk::load_data`].
pub const DEFAULT_DATA_FILE: &str = "plugin_data.json";

/// Host access for one plugin.
#[derive(Clone)]
pub struct PluginSdk {
    plugin_id: String,
    shared: Weak<Shared>,
    files: SandboxedFileOps,
    services: Arc<RwLock<HashMap<String, Service>>>,
    span: tracing::Span,
}

impl PluginSdk {
    pub(crate) fn new(
        plugin_id: &str,
        shared: Weak<Shared>,
        files: SandboxedFileOps,
        span: tracing::Span,
    ) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            shared,
            files,
            services: Arc::new(RwLock::new(HashMap::new())),
            span,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Span plugin code should log under.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Sandboxed file access.
    pub fn files(&self) -> &SandboxedFileOps {
        &self.files
    }

    pub fn data_dir(&self) -> &Path {
        self.files.data_dir()
    }

    pub fn config_dir(&self) -> &Path {
        self.files.config_dir()
    }

    fn shared(&self) -> Option<Arc<Shared>> {
        let shared = self.shared.upgrade();
        if shared.is_none() {
            tracing::debug!(plugin = %self.plugin_id, "Plugin manager is gone");
        }
        shared
    }

    // ========== Services ==========

    /// Look up a service by name. Results are cached for the lifetime of
    /// this bundle.
    pub fn get_service(&self, name: &str) -> Option<Service> {
        if let Some(service) = self.services.read().get(name) {
            return Some(service.clone());
        }
        let service = self.shared()?.service(name);
        match &service {
            Some(service) => {
                self.services
                    .write()
                    .insert(name.to_string(), service.clone());
            }
            None => tracing::warn!(plugin = %self.plugin_id, "Service not found: {}", name),
        }
        service
    }

    /// Look up a service and downcast it.
    pub fn get_service_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get_service(name)?.downcast::<T>().ok()
    }

    // ========== Configuration ==========

    /// This plugin's resolved configuration.
    pub fn config(&self) -> ConfigMap {
        self.shared()
            .map(|shared| shared.plugin_config(&self.plugin_id))
            .unwrap_or_default()
    }

    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.config().remove(key)
    }

    pub fn config_value_or(&self, key: &str, default: Value) -> Value {
        self.config_value(key).unwrap_or(default)
    }

    /// Persist one configuration value.
    pub fn set_config_value(&self, key: &str, value: Value) -> bool {
        let Some(shared) = self.shared() else {
            return false;
        };
        match shared.bridge().set_value(&self.plugin_id, key, value) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(plugin = %self.plugin_id, "Failed to set config {}: {}", key, e);
                false
            }
        }
    }

    // ========== Data ==========

    /// Save `data` as JSON in the plugin's data directory.
    pub async fn save_data<T: Serialize + ?Sized>(&self, data: &T, filename: Option<&str>) -> bool {
        self.files
            .save_json(filename.unwrap_or(DEFAULT_DATA_FILE), data)
            .await
    }

    /// Load JSON data saved with [`Self::save_data`].
    pub async fn load_data<T: DeserializeOwned>(&self, filename: Option<&str>) -> Option<T> {
        let filename = filename.unwrap_or(DEFAULT_DATA_FILE);
        if tokio::fs::metadata(self.data_dir().join(filename)).await.is_err() {
            return None;
        }
        self.files.load_json(filename).await
    }

    // ========== Events ==========

    pub fn register_event_handler(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Option<SubscriptionId> {
        let shared = self.shared()?;
        Some(shared.events().register_event_handler(
            EventOwner::plugin(&self.plugin_id),
            event_type,
            handler,
        ))
    }

    /// Subscribe for the first matching event only.
    pub fn register_event_handler_once(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Option<SubscriptionId> {
        let shared = self.shared()?;
        Some(
            shared
                .events()
                .register_once(EventOwner::plugin(&self.plugin_id), pattern, handler),
        )
    }

    /// Remove this plugin's handlers for `event_type`; all of them when
    /// `handler` is `None`.
    pub fn unregister_event_handler(
        &self,
        event_type: &str,
        handler: Option<&Arc<dyn EventHandler>>,
    ) -> usize {
        self.shared()
            .map(|shared| {
                shared.events().unregister_event_handler(
                    &EventOwner::plugin(&self.plugin_id),
                    event_type,
                    handler,
                )
            })
            .unwrap_or(0)
    }

    /// Dispatch `<plugin_id>.<name>` to every subscriber.
    pub async fn emit_event(&self, name: &str, data: EventPayload) -> HashMap<String, HandlerOutcome> {
        let Some(shared) = self.shared() else {
            return HashMap::new();
        };
        let event_type = format!("{}.{}", self.plugin_id, name);
        shared.events().dispatch(&event_type, data).await
    }

    // ========== Monitoring ==========

    pub fn register_metric(
        &self,
        metric_id: &str,
        getter: MetricGetter,
        metadata: MetricMetadata,
    ) -> bool {
        self.shared().is_some_and(|shared| {
            shared
                .host()
                .monitor()
                .register_metric(&self.plugin_id, metric_id, getter, metadata)
        })
    }

    pub fn unregister_metric(&self, metric_id: &str) -> bool {
        self.shared().is_some_and(|shared| {
            shared
                .host()
                .monitor()
                .unregister_metric(&self.plugin_id, metric_id)
        })
    }

    /// Monitor a process this plugin started.
    pub fn register_process(&self, pid: u32, name: Option<&str>) -> bool {
        self.shared().is_some_and(|shared| {
            shared
                .host()
                .monitor()
                .register_process(&self.plugin_id, pid, name)
        })
    }

    pub fn unregister_process(&self, pid: u32) -> bool {
        self.shared().is_some_and(|shared| {
            shared
                .host()
                .monitor()
                .unregister_process(&self.plugin_id, pid)
        })
    }

    /// Host-wide resource usage.
    pub fn resource_usage(&self) -> Option<SystemStats> {
        self.shared()
            .map(|shared| shared.host().monitor().system_stats())
    }

    /// Usage of every process this plugin registered.
    pub fn process_usage(&self) -> Vec<ProcessSample> {
        let Some(shared) = self.shared() else {
            return Vec::new();
        };
        let monitor = shared.host().monitor();
        monitor
            .plugin_processes(&self.plugin_id)
            .into_iter()
            .filter_map(|pid| monitor.process_metrics(&self.plugin_id, pid))
            .collect()
    }

    // ========== Other plugins ==========

    /// Ids of active plugins.
    pub fn active_plugins(&self) -> Vec<String> {
        self.shared()
            .map(|shared| shared.active_plugins())
            .unwrap_or_default()
    }

    /// Invoke an action on another plugin. Every failure is logged and
    /// yields `None`.
    pub async fn call_plugin_method(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Option<Value> {
        let shared = self.shared()?;
        match shared.call_plugin_method(plugin_id, method, args).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    plugin = %self.plugin_id,
                    "Call to {}.{} failed: {}",
                    plugin_id,
                    method,
                    e
                );
                None
            }
        }
    }

    /// Register a hook on model text of `kind`, e.g. `pre_process` or
    /// `post_process`.
    pub fn register_model_hook(&self, kind: &str, hook: ModelHook) -> bool {
        let Some(shared) = self.shared() else {
            return false;
        };
        shared
            .extensions()
            .register_model_hook(&self.plugin_id, kind, hook);
        true
    }
}

impl std::fmt::Debug for PluginSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSdk")
            .field("plugin_id", &self.plugin_id)
            .field("files", &self.files)
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached() -> PluginSdk {
        PluginSdk::new(
            "orphan",
            Weak::new(),
            SandboxedFileOps::new("orphan", "/tmp/orphan/data", "/tmp/orphan/config", None),
            tracing::Span::none(),
        )
    }

    #[tokio::test]
    async fn test_detached_bundle_degrades() {
        let sdk = detached();
        assert!(sdk.get_service("config_manager").is_none());
        assert!(sdk.config().is_empty());
        assert!(!sdk.set_config_value("k", Value::Bool(true)));
        assert!(sdk.active_plugins().is_empty());
        assert!(sdk.call_plugin_method("x", "y", Vec::new()).await.is_none());
        assert!(sdk.emit_event("ping", EventPayload::new()).await.is_empty());
        assert!(!sdk.register_model_hook("pre_process", Arc::new(|_: &str| None)));
        assert!(sdk.resource_usage().is_none());
    }
}
