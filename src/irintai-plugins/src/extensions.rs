//! Extension points plugins can populate.
//!
//! A plugin offering [`ExtensionProvider`] is queried once when it becomes
//! active. Whatever it returns is stored here under `<plugin_id>.<name>`
//! keys and removed again when the plugin is deactivated, unloaded or
//! fails. Model hooks are different: a plugin registers them through its SDK
//! at any time, they stay until the plugin is unloaded and only run while
//! their owner is active. Host components call the stored callables through
//! this registry, which contains panics and errors per callable.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::guard;
use crate::registry::DescriptorStore;
use crate::{PluginError, Result};

/// Keeps, drops or rewrites a batch of log lines.
pub type LogFilter = Arc<dyn Fn(Vec<String>) -> Vec<String> + Send + Sync>;
/// Rewrites one log line; `None` leaves it unchanged.
pub type LogProcessor = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
/// Writes log lines to a destination.
pub type LogExporter = Arc<dyn Fn(&[String], &Path) -> Result<()> + Send + Sync>;
/// Reads a document into memory entries.
pub type DocumentImporter = Arc<dyn Fn(&Path) -> Result<Vec<Value>> + Send + Sync>;
/// Transforms one memory entry.
pub type MemoryProcessor = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;
/// Writes memory entries to a destination.
pub type DocumentExporter = Arc<dyn Fn(&[Value], &Path) -> Result<()> + Send + Sync>;
/// Returns a plugin's dashboard statistics.
pub type StatsProvider = Arc<dyn Fn() -> serde_json::Map<String, Value> + Send + Sync>;
/// Rewrites a chat message for a role; `None` leaves it unchanged.
pub type MessageHook = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;
/// Rewrites model input or output; `None` leaves it unchanged.
pub type ModelHook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Declarative description of a UI element a plugin contributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiComponent {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub kind: String,
    #[serde(default)]
    pub properties: Value,
}

impl UiComponent {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            kind: kind.into(),
            properties: Value::Null,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Chat panel contribution.
#[derive(Clone, Default)]
pub struct ChatUiExtension {
    pub location: String,
    pub title: String,
    pub components: Vec<UiComponent>,
    pub message_hook: Option<MessageHook>,
}

/// Memory panel contribution.
#[derive(Clone, Default)]
pub struct MemoryExtensions {
    pub importers: IndexMap<String, DocumentImporter>,
    pub processors: IndexMap<String, MemoryProcessor>,
    pub exporters: IndexMap<String, DocumentExporter>,
    pub ui_extensions: Vec<UiComponent>,
}

/// Log viewer contribution.
#[derive(Clone, Default)]
pub struct LogViewerExtensions {
    pub log_processors: IndexMap<String, LogProcessor>,
    pub log_filters: IndexMap<String, LogFilter>,
    pub log_exporters: IndexMap<String, LogExporter>,
}

/// Dashboard contribution.
#[derive(Clone, Default)]
pub struct DashboardExtension {
    pub dashboard_tab: Option<UiComponent>,
    pub stats_provider: Option<StatsProvider>,
    pub overview_widgets: Vec<UiComponent>,
}

/// Typed extension queries. Every method is optional; `None` means the
/// plugin offers nothing for that slot.
pub trait ExtensionProvider: Send + Sync {
    fn chat_ui_extension(&self) -> Option<ChatUiExtension> {
        None
    }

    fn memory_extensions(&self) -> Option<MemoryExtensions> {
        None
    }

    fn log_viewer_extensions(&self) -> Option<LogViewerExtensions> {
        None
    }

    fn dashboard_extension(&self) -> Option<DashboardExtension> {
        None
    }
}

/// Chat panel contribution as the host sees it.
#[derive(Debug, Clone, Serialize)]
pub struct ChatPanelEntry {
    pub plugin_id: String,
    pub location: String,
    pub title: String,
    pub components: Vec<UiComponent>,
}

/// Dashboard contribution as the host sees it.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardEntry {
    pub plugin_id: String,
    pub dashboard_tab: Option<UiComponent>,
    pub overview_widgets: Vec<UiComponent>,
    pub has_stats: bool,
}

struct Named<T> {
    plugin_id: String,
    item: T,
}

#[derive(Default)]
struct Slots {
    chat: IndexMap<String, ChatPanelEntry>,
    message_hooks: IndexMap<String, Named<MessageHook>>,
    importers: IndexMap<String, Named<DocumentImporter>>,
    memory_processors: IndexMap<String, Named<MemoryProcessor>>,
    document_exporters: IndexMap<String, Named<DocumentExporter>>,
    memory_ui: IndexMap<String, Vec<UiComponent>>,
    log_processors: IndexMap<String, Named<LogProcessor>>,
    log_filters: IndexMap<String, Named<LogFilter>>,
    log_exporters: IndexMap<String, Named<LogExporter>>,
    dashboards: IndexMap<String, DashboardEntry>,
    stats_providers: IndexMap<String, Named<StatsProvider>>,
    model_hooks: Vec<(String, Named<ModelHook>)>,
}

impl Slots {
    fn remove_plugin(&mut self, plugin_id: &str) -> usize {
        fn drop_named<T>(map: &mut IndexMap<String, Named<T>>, plugin_id: &str) -> usize {
            let before = map.len();
            map.retain(|_, n| n.plugin_id != plugin_id);
            before - map.len()
        }

        let mut removed = 0;
        removed += usize::from(self.chat.shift_remove(plugin_id).is_some());
        removed += usize::from(self.memory_ui.shift_remove(plugin_id).is_some());
        removed += usize::from(self.dashboards.shift_remove(plugin_id).is_some());
        removed += drop_named(&mut self.message_hooks, plugin_id);
        removed += drop_named(&mut self.importers, plugin_id);
        removed += drop_named(&mut self.memory_processors, plugin_id);
        removed += drop_named(&mut self.document_exporters, plugin_id);
        removed += drop_named(&mut self.log_processors, plugin_id);
        removed += drop_named(&mut self.log_filters, plugin_id);
        removed += drop_named(&mut self.log_exporters, plugin_id);
        removed += drop_named(&mut self.stats_providers, plugin_id);
        removed
    }

    fn remove_model_hooks(&mut self, plugin_id: &str) -> usize {
        let before = self.model_hooks.len();
        self.model_hooks.retain(|(_, n)| n.plugin_id != plugin_id);
        before - self.model_hooks.len()
    }
}

/// Registry of everything active plugins contributed.
pub struct ExtensionRegistry {
    slots: RwLock<Slots>,
    descriptors: Arc<DescriptorStore>,
}

fn qualified(plugin_id: &str, name: &str) -> String {
    format!("{plugin_id}.{name}")
}

fn named<T>(plugin_id: &str, item: T) -> Named<T> {
    Named {
        plugin_id: plugin_id.to_string(),
        item,
    }
}

impl ExtensionRegistry {
    pub fn new(descriptors: Arc<DescriptorStore>) -> Self {
        Self {
            slots: RwLock::new(Slots::default()),
            descriptors,
        }
    }

    /// Query `provider` and store what it offers. Returns how many
    /// extension items were attached.
    pub fn attach(&self, plugin_id: &str, provider: &dyn ExtensionProvider) -> usize {
        // Query outside the lock; providers are plugin code.
        let chat = query(plugin_id, "chat_ui_extension", || provider.chat_ui_extension());
        let memory = query(plugin_id, "memory_extensions", || provider.memory_extensions());
        let logs = query(plugin_id, "log_viewer_extensions", || {
            provider.log_viewer_extensions()
        });
        let dashboard = query(plugin_id, "dashboard_extension", || {
            provider.dashboard_extension()
        });

        let mut slots = self.slots.write();
        let mut attached = 0;

        if let Some(chat) = chat {
            if let Some(hook) = chat.message_hook {
                slots
                    .message_hooks
                    .insert(plugin_id.to_string(), named(plugin_id, hook));
                attached += 1;
            }
            slots.chat.insert(
                plugin_id.to_string(),
                ChatPanelEntry {
                    plugin_id: plugin_id.to_string(),
                    location: chat.location,
                    title: chat.title,
                    components: chat.components,
                },
            );
            attached += 1;
        }

        if let Some(memory) = memory {
            for (name, f) in memory.importers {
                slots
                    .importers
                    .insert(qualified(plugin_id, &name), named(plugin_id, f));
                attached += 1;
            }
            for (name, f) in memory.processors {
                slots
                    .memory_processors
                    .insert(qualified(plugin_id, &name), named(plugin_id, f));
                attached += 1;
            }
            for (name, f) in memory.exporters {
                slots
                    .document_exporters
                    .insert(qualified(plugin_id, &name), named(plugin_id, f));
                attached += 1;
            }
            if !memory.ui_extensions.is_empty() {
                slots
                    .memory_ui
                    .insert(plugin_id.to_string(), memory.ui_extensions);
                attached += 1;
            }
        }

        if let Some(logs) = logs {
            for (name, f) in logs.log_processors {
                slots
                    .log_processors
                    .insert(qualified(plugin_id, &name), named(plugin_id, f));
                attached += 1;
            }
            for (name, f) in logs.log_filters {
                slots
                    .log_filters
                    .insert(qualified(plugin_id, &name), named(plugin_id, f));
                attached += 1;
            }
            for (name, f) in logs.log_exporters {
                slots
                    .log_exporters
                    .insert(qualified(plugin_id, &name), named(plugin_id, f));
                attached += 1;
            }
        }

        if let Some(dashboard) = dashboard {
            let has_stats = dashboard.stats_provider.is_some();
            if let Some(provider) = dashboard.stats_provider {
                slots
                    .stats_providers
                    .insert(plugin_id.to_string(), named(plugin_id, provider));
            }
            slots.dashboards.insert(
                plugin_id.to_string(),
                DashboardEntry {
                    plugin_id: plugin_id.to_string(),
                    dashboard_tab: dashboard.dashboard_tab,
                    overview_widgets: dashboard.overview_widgets,
                    has_stats,
                },
            );
            attached += 1;
        }

        if attached > 0 {
            tracing::info!("Registered {} extensions from plugin {}", attached, plugin_id);
        }
        attached
    }

    /// Remove the extensions `plugin_id` contributed on activation. Its
    /// model hooks stay registered.
    pub fn detach(&self, plugin_id: &str) -> usize {
        let removed = self.slots.write().remove_plugin(plugin_id);
        if removed > 0 {
            tracing::info!("Unregistered {} extensions from plugin {}", removed, plugin_id);
        }
        removed
    }

    /// Remove everything `plugin_id` registered, model hooks included.
    pub fn forget_plugin(&self, plugin_id: &str) -> usize {
        let mut slots = self.slots.write();
        let hooks = slots.remove_model_hooks(plugin_id);
        let removed = slots.remove_plugin(plugin_id) + hooks;
        drop(slots);
        if hooks > 0 {
            tracing::debug!("Dropped {} model hooks of {}", hooks, plugin_id);
        }
        removed
    }

    /// Register a hook run on model text of kind `kind` (e.g. `pre_process`).
    pub fn register_model_hook(&self, plugin_id: &str, kind: &str, hook: ModelHook) {
        self.slots
            .write()
            .model_hooks
            .push((kind.to_string(), named(plugin_id, hook)));
        tracing::debug!("Registered {} model hook for {}", kind, plugin_id);
    }

    // ========== Chat ==========

    pub fn chat_extensions(&self) -> Vec<ChatPanelEntry> {
        self.slots.read().chat.values().cloned().collect()
    }

    /// Run every message hook in registration order.
    pub fn process_message(&self, message: &str, role: &str) -> String {
        let hooks: Vec<_> = self
            .slots
            .read()
            .message_hooks
            .values()
            .map(|n| (n.plugin_id.clone(), n.item.clone()))
            .collect();

        let mut current = message.to_string();
        for (plugin_id, hook) in hooks {
            match guard::contain_sync(&plugin_id, "message_hook", || hook(&current, role)) {
                Ok(Some(rewritten)) => current = rewritten,
                Ok(None) => {}
                Err(e) => tracing::warn!("Error in message hook for plugin {}: {}", plugin_id, e),
            }
        }
        current
    }

    /// Run every model hook of `kind` whose owner is active, in
    /// registration order.
    pub fn apply_model_hooks(&self, kind: &str, text: &str) -> String {
        let hooks: Vec<_> = self
            .slots
            .read()
            .model_hooks
            .iter()
            .filter(|(k, n)| k == kind && self.descriptors.is_active(&n.plugin_id))
            .map(|(_, n)| (n.plugin_id.clone(), n.item.clone()))
            .collect();

        let mut current = text.to_string();
        for (plugin_id, hook) in hooks {
            match guard::contain_sync(&plugin_id, kind, || hook(&current)) {
                Ok(Some(rewritten)) => current = rewritten,
                Ok(None) => {}
                Err(e) => tracing::warn!("Error in {} model hook of {}: {}", kind, plugin_id, e),
            }
        }
        current
    }

    // ========== Memory ==========

    pub fn importer_names(&self) -> Vec<String> {
        self.slots.read().importers.keys().cloned().collect()
    }

    pub fn memory_processor_names(&self) -> Vec<String> {
        self.slots.read().memory_processors.keys().cloned().collect()
    }

    pub fn document_exporter_names(&self) -> Vec<String> {
        self.slots.read().document_exporters.keys().cloned().collect()
    }

    pub fn memory_ui(&self, plugin_id: &str) -> Vec<UiComponent> {
        self.slots
            .read()
            .memory_ui
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn import_document(&self, importer: &str, path: &Path) -> Result<Vec<Value>> {
        let (plugin_id, f) = lookup(&self.slots.read().importers, importer)?;
        guard::contain_sync(&plugin_id, importer, || f(path))?
    }

    pub fn process_memory(&self, processor: &str, entry: Value) -> Result<Value> {
        let (plugin_id, f) = lookup(&self.slots.read().memory_processors, processor)?;
        guard::contain_sync(&plugin_id, processor, || f(entry))?
    }

    pub fn export_documents(&self, exporter: &str, entries: &[Value], path: &Path) -> Result<()> {
        let (plugin_id, f) = lookup(&self.slots.read().document_exporters, exporter)?;
        guard::contain_sync(&plugin_id, exporter, || f(entries, path))?
    }

    // ========== Log viewer ==========

    pub fn log_filter_names(&self) -> Vec<String> {
        self.slots.read().log_filters.keys().cloned().collect()
    }

    pub fn log_exporter_names(&self) -> Vec<String> {
        self.slots.read().log_exporters.keys().cloned().collect()
    }

    /// Apply a named filter. On failure the lines come back unfiltered with
    /// an error line appended.
    pub fn apply_log_filter(&self, filter: &str, lines: Vec<String>) -> Vec<String> {
        let Ok((plugin_id, f)) = lookup(&self.slots.read().log_filters, filter) else {
            return lines;
        };
        let input = lines.clone();
        match guard::contain_sync(&plugin_id, filter, move || f(input)) {
            Ok(filtered) => filtered,
            Err(e) => {
                let mut lines = lines;
                lines.push(format!("Error applying plugin filter: {e}"));
                lines
            }
        }
    }

    /// Run every log processor over `line` in registration order; failing
    /// processors are skipped.
    pub fn process_log_line(&self, line: &str) -> String {
        let processors: Vec<_> = self
            .slots
            .read()
            .log_processors
            .values()
            .map(|n| (n.plugin_id.clone(), n.item.clone()))
            .collect();

        let mut current = line.to_string();
        for (plugin_id, f) in processors {
            if let Ok(Some(rewritten)) =
                guard::contain_sync(&plugin_id, "log_processor", || f(&current))
            {
                if !rewritten.is_empty() {
                    current = rewritten;
                }
            }
        }
        current
    }

    pub fn export_logs(&self, exporter: &str, lines: &[String], path: &Path) -> Result<()> {
        let (plugin_id, f) = lookup(&self.slots.read().log_exporters, exporter)?;
        guard::contain_sync(&plugin_id, exporter, || f(lines, path))?
    }

    // ========== Dashboard ==========

    pub fn dashboards(&self) -> Vec<DashboardEntry> {
        self.slots.read().dashboards.values().cloned().collect()
    }

    /// Statistics from every provider; failing or empty providers are
    /// left out.
    pub fn dashboard_stats(&self) -> IndexMap<String, serde_json::Map<String, Value>> {
        let providers: Vec<_> = self
            .slots
            .read()
            .stats_providers
            .iter()
            .map(|(id, n)| (id.clone(), n.item.clone()))
            .collect();

        providers
            .into_iter()
            .filter_map(|(plugin_id, f)| {
                match guard::contain_sync(&plugin_id, "stats_provider", || f()) {
                    Ok(stats) if !stats.is_empty() => Some((plugin_id, stats)),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!("Error getting stats from plugin {}: {}", plugin_id, e);
                        None
                    }
                }
            })
            .collect()
    }

    /// Whether `plugin_id` currently contributes extensions. Model hooks
    /// are not counted.
    pub fn has_extensions(&self, plugin_id: &str) -> bool {
        let slots = self.slots.read();
        slots.chat.contains_key(plugin_id)
            || slots.dashboards.contains_key(plugin_id)
            || slots.memory_ui.contains_key(plugin_id)
            || slots.importers.values().any(|n| n.plugin_id == plugin_id)
            || slots.memory_processors.values().any(|n| n.plugin_id == plugin_id)
            || slots.document_exporters.values().any(|n| n.plugin_id == plugin_id)
            || slots.log_processors.values().any(|n| n.plugin_id == plugin_id)
            || slots.log_filters.values().any(|n| n.plugin_id == plugin_id)
            || slots.log_exporters.values().any(|n| n.plugin_id == plugin_id)
    }

    /// Number of model hooks `plugin_id` has registered, active or not.
    pub fn model_hook_count(&self, plugin_id: &str) -> usize {
        self.slots
            .read()
            .model_hooks
            .iter()
            .filter(|(_, n)| n.plugin_id == plugin_id)
            .count()
    }
}

fn query<T>(plugin_id: &str, what: &str, f: impl FnOnce() -> Option<T>) -> Option<T> {
    match guard::contain_sync(plugin_id, what, f) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Error registering {} from plugin {}: {}", what, plugin_id, e);
            None
        }
    }
}

fn lookup<T: Clone>(map: &IndexMap<String, Named<T>>, name: &str) -> Result<(String, T)> {
    map.get(name)
        .map(|n| (n.plugin_id.clone(), n.item.clone()))
        .ok_or_else(|| PluginError::NotFound(format!("extension '{name}'")))
}
