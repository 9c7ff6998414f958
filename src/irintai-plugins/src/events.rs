//! Event bus for host and plugin communication.
//!
//! Handlers are registered per owner and event pattern. A pattern is an
//! event name in which `*` matches any run of characters, so `notes.*`,
//! `*.saved` and `*` all see `notes.saved`. A dispatch calls every matching
//! handler in registration order and collects one outcome per owner.
//! Handlers owned by a plugin only run while that plugin is `Active`; a
//! failing or panicking handler is recorded and the remaining handlers
//! still run. The bus keeps the most recent dispatches of each event name.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Result;
use crate::guard;
use crate::registry::DescriptorStore;

/// Keyword data carried by an event.
pub type EventPayload = serde_json::Map<String, Value>;

/// Dispatches remembered per event name.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Who registered a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventOwner {
    /// A host component; always invoked.
    Host(String),
    /// A plugin; invoked only while the plugin is active.
    Plugin(String),
}

impl EventOwner {
    pub fn host(name: impl Into<String>) -> Self {
        Self::Host(name.into())
    }

    pub fn plugin(id: impl Into<String>) -> Self {
        Self::Plugin(id.into())
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Host(id) | Self::Plugin(id) => id,
        }
    }

    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            Self::Plugin(id) => Some(id),
            Self::Host(_) => None,
        }
    }
}

impl std::fmt::Display for EventOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(id) => write!(f, "host:{id}"),
            Self::Plugin(id) => write!(f, "plugin:{id}"),
        }
    }
}

/// Event handler trait.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event. The returned value becomes the owner's result.
    async fn handle(&self, event_type: &str, data: &EventPayload) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(String, EventPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn handle(&self, event_type: &str, data: &EventPayload) -> Result<Value> {
        (self.0)(event_type.to_string(), data.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(String, EventPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Identifies one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    owner: EventOwner,
    pattern: String,
    handler: Arc<dyn EventHandler>,
    once: bool,
}

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub event_type: String,
    pub data: EventPayload,
    pub timestamp: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

/// Whether `event_type` matches `pattern`, where each `*` stands for any
/// run of characters, including none.
pub fn matches_pattern(event_type: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    if !pattern.contains('*') {
        return false;
    }

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = event_type.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return false;
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// What one owner's handler produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HandlerOutcome {
    Completed(Value),
    Failed { error: String },
}

impl HandlerOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Failed { .. } => None,
        }
    }
}

/// Lifecycle notifications published by the plugin manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    PluginLoaded { plugin_id: String },
    PluginActivated { plugin_id: String },
    PluginDeactivated { plugin_id: String },
    PluginUnloaded { plugin_id: String },
    PluginError { plugin_id: String, message: String },
    PluginUninstalled { plugin_id: String },
    PluginConfigured { plugin_id: String },
}

impl HostEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PluginLoaded { .. } => "plugin_loaded",
            Self::PluginActivated { .. } => "plugin_activated",
            Self::PluginDeactivated { .. } => "plugin_deactivated",
            Self::PluginUnloaded { .. } => "plugin_unloaded",
            Self::PluginError { .. } => "plugin_error",
            Self::PluginUninstalled { .. } => "plugin_uninstalled",
            Self::PluginConfigured { .. } => "plugin_configured",
        }
    }

    pub fn plugin_id(&self) -> &str {
        match self {
            Self::PluginLoaded { plugin_id }
            | Self::PluginActivated { plugin_id }
            | Self::PluginDeactivated { plugin_id }
            | Self::PluginUnloaded { plugin_id }
            | Self::PluginError { plugin_id, .. }
            | Self::PluginUninstalled { plugin_id }
            | Self::PluginConfigured { plugin_id } => plugin_id,
        }
    }

    /// Keyword data for dispatch.
    pub fn payload(&self) -> EventPayload {
        let mut data = EventPayload::new();
        data.insert("plugin_id".into(), Value::String(self.plugin_id().to_string()));
        if let Self::PluginError { message, .. } = self {
            data.insert("message".into(), Value::String(message.clone()));
        }
        data
    }
}

/// Event bus.
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    descriptors: Arc<DescriptorStore>,
    history: RwLock<HashMap<String, VecDeque<EventRecord>>>,
    history_limit: usize,
    next_seq: AtomicU64,
}

impl EventBus {
    /// Create a bus that checks plugin status in `descriptors`.
    pub fn new(descriptors: Arc<DescriptorStore>) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            descriptors,
            history: RwLock::new(HashMap::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Remember at most `limit` dispatches per event name.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Subscribe `handler` to events matching `pattern`. Registering the
    /// same handler twice makes it run twice per dispatch.
    pub fn register_event_handler(
        &self,
        owner: EventOwner,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.subscribe(owner, pattern.into(), handler, false)
    }

    /// Subscribe `handler` for the first matching dispatch it runs in.
    pub fn register_once(
        &self,
        owner: EventOwner,
        pattern: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.subscribe(owner, pattern.into(), handler, true)
    }

    fn subscribe(
        &self,
        owner: EventOwner,
        pattern: String,
        handler: Arc<dyn EventHandler>,
        once: bool,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        tracing::debug!("{} subscribed to '{}' (once: {})", owner, pattern, once);
        self.subscriptions.write().push(Subscription {
            id,
            owner,
            pattern,
            handler,
            once,
        });
        id
    }

    /// Remove `owner`'s handlers registered under `pattern`: all of them,
    /// or only those that are the same `Arc` as `handler`. Returns how many
    /// were removed.
    pub fn unregister_event_handler(
        &self,
        owner: &EventOwner,
        pattern: &str,
        handler: Option<&Arc<dyn EventHandler>>,
    ) -> usize {
        self.remove_where(|s| {
            &s.owner == owner
                && s.pattern == pattern
                && handler.is_none_or(|h| Arc::ptr_eq(h, &s.handler))
        })
    }

    /// Remove one registration.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.remove_where(|s| s.id == id) > 0
    }

    /// Remove every handler of `owner`.
    pub fn unregister_owner(&self, owner: &EventOwner) -> usize {
        let removed = self.remove_where(|s| &s.owner == owner);
        if removed > 0 {
            tracing::debug!("Removed {} subscriptions of {}", removed, owner);
        }
        removed
    }

    /// Call every handler whose pattern matches `event_type` and collect
    /// results by owner id.
    pub async fn dispatch(
        &self,
        event_type: &str,
        data: EventPayload,
    ) -> HashMap<String, HandlerOutcome> {
        self.remember(event_type, &data);

        let matching: Vec<Subscription> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| matches_pattern(event_type, &s.pattern))
            .cloned()
            .collect();

        let mut results = HashMap::new();
        for sub in matching {
            // Status is checked per handler: an earlier handler may have
            // deactivated this owner.
            if let Some(plugin_id) = sub.owner.plugin_id() {
                if !self.descriptors.is_active(plugin_id) {
                    tracing::trace!("Skipping '{}' handler of inactive {}", event_type, plugin_id);
                    continue;
                }
            }
            // A concurrent dispatch may already have consumed it.
            if sub.once && !self.unsubscribe(sub.id) {
                continue;
            }

            let outcome = match guard::contain(
                sub.owner.id(),
                event_type,
                sub.handler.handle(event_type, &data),
            )
            .await
            {
                Ok(value) => HandlerOutcome::Completed(value),
                Err(e) => {
                    tracing::error!("Error in {} handler for '{}': {}", sub.owner, event_type, e);
                    HandlerOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            results.insert(sub.owner.id().to_string(), outcome);
        }
        results
    }

    /// Dispatch a lifecycle notification.
    pub async fn publish(&self, event: HostEvent) -> HashMap<String, HandlerOutcome> {
        self.dispatch(event.event_type(), event.payload()).await
    }

    /// Get the number of subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Patterns `owner` is subscribed to, in registration order.
    pub fn owner_subscriptions(&self, owner: &EventOwner) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| &s.owner == owner)
            .map(|s| s.pattern.clone())
            .collect()
    }

    /// Subscription count per pattern, in first-registration order. With
    /// `pattern`, only that pattern is counted.
    pub fn list_subscribers(&self, pattern: Option<&str>) -> IndexMap<String, usize> {
        let mut counts = IndexMap::new();
        for sub in self.subscriptions.read().iter() {
            if pattern.is_none_or(|p| p == sub.pattern) {
                *counts.entry(sub.pattern.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Recent dispatches, oldest first: of one event name, or of all of
    /// them. `limit` keeps only the newest entries.
    pub fn event_history(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<EventRecord> {
        let history = self.history.read();
        let mut records: Vec<EventRecord> = match event_type {
            Some(name) => history
                .get(name)
                .map(|entries| entries.iter().cloned().collect())
                .unwrap_or_default(),
            None => {
                let mut all: Vec<EventRecord> =
                    history.values().flat_map(|entries| entries.iter().cloned()).collect();
                all.sort_by_key(|record| record.seq);
                all
            }
        };
        drop(history);

        if let Some(limit) = limit {
            let skip = records.len().saturating_sub(limit);
            records.drain(..skip);
        }
        records
    }

    /// Forget recorded dispatches of one event name, or of all of them.
    pub fn clear_event_history(&self, event_type: Option<&str>) {
        let mut history = self.history.write();
        match event_type {
            Some(name) => {
                history.remove(name);
            }
            None => history.clear(),
        }
    }

    fn remember(&self, event_type: &str, data: &EventPayload) {
        if self.history_limit == 0 {
            return;
        }
        let record = EventRecord {
            event_type: event_type.to_string(),
            data: data.clone(),
            timestamp: Utc::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let mut history = self.history.write();
        let entries = history.entry(event_type.to_string()).or_default();
        entries.push_back(record);
        while entries.len() > self.history_limit {
            entries.pop_front();
        }
    }

    fn remove_where(&self, pred: impl Fn(&Subscription) -> bool) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| !pred(s));
        before - subscriptions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PluginError;
    use crate::plugin::PluginStatus;
    use serde_json::json;
    use std::path::Path;

    fn bus_with_active(ids: &[&str]) -> (EventBus, Arc<DescriptorStore>) {
        let store = Arc::new(DescriptorStore::new());
        for id in ids {
            store.insert_discovered(id, Path::new("/p"));
            store.set_status(id, PluginStatus::Active);
        }
        (EventBus::new(store.clone()), store)
    }

    fn echo(tag: &'static str) -> Arc<dyn EventHandler> {
        handler_fn(move |_, data| async move {
            Ok(json!({"tag": tag, "n": data.get("n").cloned()}))
        })
    }

    #[tokio::test]
    async fn test_dispatch_to_active_plugins() {
        let (bus, _) = bus_with_active(&["a"]);
        bus.register_event_handler(EventOwner::plugin("a"), "tick", echo("a"));

        let mut data = EventPayload::new();
        data.insert("n".into(), json!(3));
        let results = bus.dispatch("tick", data).await;

        assert_eq!(
            results["a"],
            HandlerOutcome::Completed(json!({"tag": "a", "n": 3}))
        );
        assert!(bus.dispatch("other", EventPayload::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_owner_skipped() {
        let (bus, store) = bus_with_active(&["a"]);
        store.insert_discovered("b", Path::new("/p"));
        store.set_status("b", PluginStatus::Inactive);

        bus.register_event_handler(EventOwner::plugin("a"), "tick", echo("a"));
        bus.register_event_handler(EventOwner::plugin("b"), "tick", echo("b"));
        bus.register_event_handler(EventOwner::host("ui"), "tick", echo("ui"));

        let results = bus.dispatch("tick", EventPayload::new()).await;
        assert!(results.contains_key("a"));
        assert!(results.contains_key("ui"));
        assert!(!results.contains_key("b"));
    }

    #[tokio::test]
    async fn test_failing_handler_isolated() {
        let (bus, _) = bus_with_active(&["a", "b", "c"]);
        bus.register_event_handler(EventOwner::plugin("a"), "tick", echo("a"));
        bus.register_event_handler(
            EventOwner::plugin("b"),
            "tick",
            handler_fn(|_, _| async { Err(PluginError::ConfigError("broken".into())) }),
        );
        bus.register_event_handler(EventOwner::plugin("c"), "tick", echo("c"));

        let results = bus.dispatch("tick", EventPayload::new()).await;
        assert_eq!(results.len(), 3);
        assert!(results["b"].is_error());
        assert!(!results["c"].is_error());

        let serialized = serde_json::to_value(&results["b"]).unwrap();
        assert_eq!(serialized, json!({"error": "Configuration error: broken"}));
    }

    #[tokio::test]
    async fn test_duplicate_registration_runs_twice() {
        let (bus, _) = bus_with_active(&["a"]);
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        let handler = handler_fn(move |_, _| {
            let c = c.clone();
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        bus.register_event_handler(EventOwner::plugin("a"), "tick", handler.clone());
        bus.register_event_handler(EventOwner::plugin("a"), "tick", handler.clone());
        bus.dispatch("tick", EventPayload::new()).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);

        let owner = EventOwner::plugin("a");
        assert_eq!(bus.unregister_event_handler(&owner, "tick", Some(&handler)), 2);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unregister_all_for_event() {
        let (bus, _) = bus_with_active(&["a"]);
        let owner = EventOwner::plugin("a");
        bus.register_event_handler(owner.clone(), "tick", echo("1"));
        bus.register_event_handler(owner.clone(), "tick", echo("2"));
        bus.register_event_handler(owner.clone(), "tock", echo("3"));

        let other = echo("x");
        assert_eq!(bus.unregister_event_handler(&owner, "tick", Some(&other)), 0);
        assert_eq!(bus.unregister_event_handler(&owner, "tick", None), 2);
        assert_eq!(bus.owner_subscriptions(&owner), vec!["tock"]);

        assert_eq!(bus.unregister_owner(&owner), 1);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("notes.saved", "*"));
        assert!(matches_pattern("notes.saved", "notes.saved"));
        assert!(matches_pattern("notes.saved", "notes.*"));
        assert!(matches_pattern("notes.saved", "*.saved"));
        assert!(matches_pattern("notes.draft.saved", "notes.*.saved"));
        assert!(matches_pattern("notes.saved", "n*s*d"));

        assert!(!matches_pattern("notes.saved", "notes"));
        assert!(!matches_pattern("notebook.saved", "notes.*"));
        assert!(!matches_pattern("notes.deleted", "*.saved"));
        assert!(!matches_pattern("notes.saved", "notes.*.saved"));
        assert!(!matches_pattern("aba", "ab*ba"));
    }

    #[tokio::test]
    async fn test_wildcard_subscribers_receive_dispatch() {
        let (bus, _) = bus_with_active(&["a", "b", "c", "d"]);
        bus.register_event_handler(EventOwner::plugin("a"), "notes.*", echo("a"));
        bus.register_event_handler(EventOwner::plugin("b"), "*.saved", echo("b"));
        bus.register_event_handler(EventOwner::plugin("c"), "*", echo("c"));
        bus.register_event_handler(EventOwner::plugin("d"), "tasks.*", echo("d"));

        let results = bus.dispatch("notes.saved", EventPayload::new()).await;
        let mut owners: Vec<_> = results.keys().cloned().collect();
        owners.sort();
        assert_eq!(owners, vec!["a", "b", "c"]);

        let owner = EventOwner::plugin("a");
        assert_eq!(bus.unregister_event_handler(&owner, "notes.saved", None), 0);
        assert_eq!(bus.unregister_event_handler(&owner, "notes.*", None), 1);
    }

    #[tokio::test]
    async fn test_once_handler_runs_once() {
        let (bus, store) = bus_with_active(&["a"]);
        store.insert_discovered("idle", Path::new("/p"));
        store.set_status("idle", PluginStatus::Inactive);

        bus.register_once(EventOwner::plugin("a"), "tick", echo("a"));
        bus.register_once(EventOwner::plugin("idle"), "tick", echo("idle"));
        bus.register_event_handler(EventOwner::host("ui"), "tick", echo("ui"));

        let first = bus.dispatch("tick", EventPayload::new()).await;
        assert!(first.contains_key("a"));
        let second = bus.dispatch("tick", EventPayload::new()).await;
        assert!(!second.contains_key("a"));
        assert!(second.contains_key("ui"));

        // Skipped while inactive, so still waiting.
        assert_eq!(bus.owner_subscriptions(&EventOwner::plugin("idle")), vec!["tick"]);
        store.set_status("idle", PluginStatus::Active);
        assert!(bus.dispatch("tick", EventPayload::new()).await.contains_key("idle"));
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_event_history_is_bounded() {
        let (bus, _) = bus_with_active(&[]);
        let bus = bus.with_history_limit(3);

        for n in 0..5 {
            let mut data = EventPayload::new();
            data.insert("n".into(), json!(n));
            bus.dispatch("tick", data).await;
        }
        bus.dispatch("tock", EventPayload::new()).await;

        let ticks = bus.event_history(Some("tick"), None);
        let seen: Vec<_> = ticks.iter().map(|r| r.data["n"].clone()).collect();
        assert_eq!(seen, vec![json!(2), json!(3), json!(4)]);

        let all = bus.event_history(None, Some(2));
        let names: Vec<_> = all.iter().map(|r| r.event_type.as_str()).collect();
        assert_eq!(names, vec!["tick", "tock"]);
        assert!(bus.event_history(Some("never"), None).is_empty());

        bus.clear_event_history(Some("tick"));
        assert_eq!(bus.event_history(None, None).len(), 1);
        bus.clear_event_history(None);
        assert!(bus.event_history(None, None).is_empty());
    }

    #[test]
    fn test_list_subscribers() {
        let (bus, _) = bus_with_active(&[]);
        bus.register_event_handler(EventOwner::host("ui"), "notes.*", echo("1"));
        bus.register_event_handler(EventOwner::plugin("a"), "tick", echo("2"));
        bus.register_once(EventOwner::plugin("b"), "notes.*", echo("3"));

        let all = bus.list_subscribers(None);
        assert_eq!(all.into_iter().collect::<Vec<_>>(), vec![
            ("notes.*".to_string(), 2),
            ("tick".to_string(), 1),
        ]);
        assert_eq!(bus.list_subscribers(Some("tick"))["tick"], 1);
        assert!(bus.list_subscribers(Some("tock")).is_empty());
    }

    #[test]
    fn test_host_event_payload() {
        let event = HostEvent::PluginError {
            plugin_id: "a".into(),
            message: "bad".into(),
        };
        assert_eq!(event.event_type(), "plugin_error");
        assert_eq!(
            Value::Object(event.payload()),
            json!({"plugin_id": "a", "message": "bad"})
        );
    }
}
