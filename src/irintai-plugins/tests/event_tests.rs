//! Event delivery through the plugin manager.

mod common;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio_test::{assert_err, assert_ok};

use common::{Activation, Harness};
use irintai_plugins::{
    ConfigMap, EventHandler, EventOwner, EventPayload, HandlerOutcome, PluginError, PluginManager,
    PluginStatus, Result, handler_fn,
};

fn reply(tag: &'static str) -> Arc<dyn EventHandler> {
    handler_fn(move |_, _| async move { Ok(json!(tag)) })
}

/// Host handler that appends `<event>:<plugin_id>` to `log`.
fn recorder(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn EventHandler> {
    handler_fn(move |event_type, data| {
        let log = log.clone();
        async move {
            let plugin_id = data
                .get("plugin_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            log.lock().push(format!("{event_type}:{plugin_id}"));
            Ok(Value::Null)
        }
    })
}

async fn fail(_: String, _: EventPayload) -> Result<Value> {
    Err(PluginError::ConfigError("handler broke".to_string()))
}

async fn explode(_: String, _: EventPayload) -> Result<Value> {
    panic!("handler exploded")
}

#[tokio::test]
async fn test_host_handlers_always_run() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    let manager = harness.manager().await;
    manager.register_event_handler(EventOwner::host("chat_panel"), "chat_message", reply("host"));

    assert_ok!(manager.load("notes").await);
    let sdk = harness.journal.sdk("notes");
    assert!(sdk.register_event_handler("chat_message", reply("plugin")).is_some());

    let results = manager.trigger_event("chat_message", EventPayload::new()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results["chat_panel"], HandlerOutcome::Completed(json!("host")));

    assert_ok!(manager.activate("notes").await);
    let results = manager.trigger_event("chat_message", EventPayload::new()).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results["notes"], HandlerOutcome::Completed(json!("plugin")));

    assert_ok!(manager.deactivate("notes").await);
    let results = manager.trigger_event("chat_message", EventPayload::new()).await;
    assert!(!results.contains_key("notes"));
    assert!(results.contains_key("chat_panel"));
}

#[tokio::test]
async fn test_failing_handlers_isolated() {
    let harness = Harness::new();
    let manager = harness.manager().await;
    manager.register_event_handler(EventOwner::host("a"), "tick", handler_fn(fail));
    manager.register_event_handler(EventOwner::host("b"), "tick", handler_fn(explode));
    manager.register_event_handler(EventOwner::host("c"), "tick", reply("c"));

    let results = manager.trigger_event("tick", EventPayload::new()).await;

    assert_eq!(results.len(), 3);
    assert!(results["a"].is_error());
    assert!(results["b"].is_error());
    assert_eq!(results["c"].value(), Some(&json!("c")));
    assert_eq!(
        serde_json::to_value(&results["b"]).unwrap(),
        json!({"error": "Plugin 'b' panicked: handler exploded"})
    );
}

#[tokio::test]
async fn test_lifecycle_notifications() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    harness.add("broken", harness.factory("Broken").activation(Activation::Fail));
    let manager = harness.manager().await;

    let log = Arc::new(Mutex::new(Vec::new()));
    for event in [
        "plugin_loaded",
        "plugin_activated",
        "plugin_deactivated",
        "plugin_unloaded",
        "plugin_error",
        "plugin_configured",
    ] {
        manager.register_event_handler(EventOwner::host("audit"), event, recorder(log.clone()));
    }

    assert_ok!(manager.load("notes").await);
    assert_ok!(manager.activate("notes").await);
    assert_ok!(manager.set_config("notes", ConfigMap::new()).await);
    assert_ok!(manager.unload("notes").await);
    assert_ok!(manager.load("broken").await);
    assert_err!(manager.activate("broken").await);

    assert_eq!(
        *log.lock(),
        vec![
            "plugin_loaded:notes",
            "plugin_activated:notes",
            "plugin_configured:notes",
            "plugin_deactivated:notes",
            "plugin_unloaded:notes",
            "plugin_loaded:broken",
            "plugin_error:broken",
        ]
    );
}

#[tokio::test]
async fn test_error_notification_carries_message() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    let manager = harness.manager().await;

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    manager.register_event_handler(
        EventOwner::host("audit"),
        "plugin_error",
        handler_fn(move |_, data| {
            let sink = sink.clone();
            async move {
                *sink.lock() = data.get("message").cloned();
                Ok(Value::Null)
            }
        }),
    );

    assert_ok!(manager.load("notes").await);
    manager.report_failure("notes", "lost connection").await;

    assert_eq!(*seen.lock(), Some(json!("lost connection")));
}

#[tokio::test]
async fn test_handler_may_drive_manager() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    let manager = Arc::new(harness.manager().await);

    let weak: Weak<PluginManager> = Arc::downgrade(&manager);
    manager.register_event_handler(
        EventOwner::host("supervisor"),
        "plugin_activated",
        handler_fn(move |_, data| {
            let weak = weak.clone();
            async move {
                let Some(manager) = weak.upgrade() else {
                    return Ok(Value::Null);
                };
                let id = data
                    .get("plugin_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                match manager.deactivate(&id).await {
                    Ok(()) => Ok(json!(manager.status(&id).to_string())),
                    Err(e) => Err(e),
                }
            }
        }),
    );

    assert_ok!(manager.load("notes").await);
    assert_ok!(manager.activate("notes").await);

    assert_eq!(manager.status("notes"), PluginStatus::Inactive);
}

#[tokio::test]
async fn test_plugin_handlers_removed_on_unload() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    let manager = harness.manager().await;
    assert_ok!(manager.load("notes").await);

    let sdk = harness.journal.sdk("notes");
    sdk.register_event_handler("chat_message", reply("one"));
    sdk.register_event_handler("chat_message", reply("two"));
    sdk.register_event_handler("model_loaded", reply("three"));

    let owner = EventOwner::plugin("notes");
    assert_eq!(sdk.unregister_event_handler("chat_message", None), 2);
    assert_eq!(
        manager.event_bus().owner_subscriptions(&owner),
        vec!["model_loaded"]
    );

    assert_ok!(manager.unload("notes").await);
    assert!(manager.event_bus().owner_subscriptions(&owner).is_empty());
}

#[tokio::test]
async fn test_emit_event_is_namespaced() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    let manager = harness.manager().await;
    manager.register_event_handler(
        EventOwner::host("ui"),
        "notes.saved",
        handler_fn(|_, data| async move { Ok(data.get("title").cloned().unwrap_or_default()) }),
    );
    assert_ok!(manager.load("notes").await);

    let mut data = EventPayload::new();
    data.insert("title".into(), json!("Groceries"));
    let results = harness.journal.sdk("notes").emit_event("saved", data).await;

    assert_eq!(results["ui"], HandlerOutcome::Completed(json!("Groceries")));
}

#[tokio::test]
async fn test_wildcard_handlers_see_plugin_events() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    harness.add("tasks", harness.factory("Tasks"));
    let manager = harness.manager().await;

    let log = Arc::new(Mutex::new(Vec::new()));
    manager.register_event_handler(EventOwner::host("notes_view"), "notes.*", recorder(log.clone()));
    manager.register_event_handler(EventOwner::host("autosave"), "*.saved", reply("saved"));
    manager.register_event_handler(EventOwner::host("audit"), "*", reply("seen"));

    assert_ok!(manager.load("notes").await);
    assert_ok!(manager.load("tasks").await);

    let results = harness.journal.sdk("notes").emit_event("saved", EventPayload::new()).await;
    assert_eq!(results.len(), 3);
    assert_eq!(results["autosave"], HandlerOutcome::Completed(json!("saved")));

    let results = harness.journal.sdk("tasks").emit_event("deleted", EventPayload::new()).await;
    assert_eq!(results.keys().collect::<Vec<_>>(), vec!["audit"]);

    // The catch-all also sees lifecycle notifications.
    let history = manager.event_bus().event_history(None, None);
    let names: Vec<_> = history.iter().map(|r| r.event_type.as_str()).collect();
    assert_eq!(
        names,
        vec!["plugin_loaded", "plugin_loaded", "notes.saved", "tasks.deleted"]
    );
    assert_eq!(*log.lock(), vec!["notes.saved:"]);
}

#[tokio::test]
async fn test_once_handler_from_plugin() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    let manager = harness.manager().await;
    assert_ok!(manager.load("notes").await);
    assert_ok!(manager.activate("notes").await);

    let sdk = harness.journal.sdk("notes");
    assert!(sdk.register_event_handler_once("chat_*", reply("first")).is_some());
    assert_eq!(manager.event_bus().list_subscribers(Some("chat_*"))["chat_*"], 1);

    let results = manager.trigger_event("chat_message", EventPayload::new()).await;
    assert_eq!(results["notes"], HandlerOutcome::Completed(json!("first")));
    let results = manager.trigger_event("chat_message", EventPayload::new()).await;
    assert!(!results.contains_key("notes"));
    assert!(manager.event_bus().list_subscribers(Some("chat_*")).is_empty());
}
