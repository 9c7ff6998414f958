//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use semver::Version;
use serde_json::Value;
use tempfile::TempDir;

use irintai_plugins::extensions::{MessageHook, ModelHook};
use irintai_plugins::{
    ActionProvider, ChatUiExtension, ConfigMap, ConfigSchema, Configurable, ExtensionProvider,
    HookOutcome, HostContext, HostPaths, JsonConfigStore, Lifecycle, MANIFEST_FILE, Plugin,
    PluginCatalog, PluginDependencies, PluginError, PluginFactory, PluginInit, PluginManager,
    PluginMetadata, PluginSdk, Result, UiComponent,
};

/// What a test plugin does when asked to activate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Accept,
    Decline,
    Fail,
    Panic,
}

/// Record of what test plugins did, shared with the test body.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
    sdks: Mutex<HashMap<String, PluginSdk>>,
    applied: Mutex<HashMap<String, ConfigMap>>,
}

impl Journal {
    fn record(&self, entry: String) {
        self.entries.lock().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn entries_with(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    /// Capability bundle handed to the most recent instance of `id`.
    pub fn sdk(&self, id: &str) -> PluginSdk {
        self.sdks
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("plugin {id} was never constructed"))
    }

    /// Last configuration pushed to `id` through its hook.
    pub fn applied_config(&self, id: &str) -> Option<ConfigMap> {
        self.applied.lock().get(id).cloned()
    }
}

pub struct TestFactory {
    metadata: PluginMetadata,
    activation: Activation,
    defaults: ConfigMap,
    schema: Option<ConfigSchema>,
    chat_hook: bool,
    model_hook: bool,
    panic_on_create: AtomicBool,
    journal: Arc<Journal>,
    created: AtomicUsize,
}

impl TestFactory {
    pub fn new(name: &str, journal: Arc<Journal>) -> Self {
        Self {
            metadata: PluginMetadata::new(name, "1.0.0")
                .with_description(format!("{name} test plugin"))
                .with_author("Irintai Team"),
            activation: Activation::Accept,
            defaults: ConfigMap::new(),
            schema: None,
            chat_hook: false,
            model_hook: false,
            panic_on_create: AtomicBool::new(false),
            journal,
            created: AtomicUsize::new(0),
        }
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn defaults(mut self, defaults: ConfigMap) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn schema(mut self, schema: ConfigSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn depends_on(mut self, dependencies: PluginDependencies) -> Self {
        self.metadata = self.metadata.with_dependencies(dependencies);
        self
    }

    pub fn with_chat_hook(mut self) -> Self {
        self.chat_hook = true;
        self
    }

    /// Register a `pre_process` model hook wrapping text in brackets from
    /// the constructor.
    pub fn with_model_hook(mut self) -> Self {
        self.model_hook = true;
        self
    }

    pub fn panic_on_create(self) -> Self {
        self.start_panicking();
        self
    }

    /// Make every later construction panic.
    pub fn start_panicking(&self) {
        self.panic_on_create.store(true, Ordering::SeqCst);
    }

    /// Number of instances constructed so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl PluginFactory for TestFactory {
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    fn config_schema(&self) -> Option<ConfigSchema> {
        self.schema.clone()
    }

    fn create(&self, init: PluginInit) -> Result<Arc<dyn Plugin>> {
        if self.panic_on_create.load(Ordering::SeqCst) {
            panic!("constructor exploded");
        }
        if self.model_hook {
            let hook: ModelHook = Arc::new(|text: &str| Some(format!("[{text}]")));
            init.sdk.register_model_hook("pre_process", hook);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.journal
            .sdks
            .lock()
            .insert(init.plugin_id.clone(), init.sdk.clone());
        Ok(Arc::new(TestPlugin {
            id: init.plugin_id,
            activation: self.activation,
            defaults: self.defaults.clone(),
            chat_hook: self.chat_hook,
            journal: self.journal.clone(),
        }))
    }
}

struct TestPlugin {
    id: String,
    activation: Activation,
    defaults: ConfigMap,
    chat_hook: bool,
    journal: Arc<Journal>,
}

impl Plugin for TestPlugin {
    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        Some(self)
    }

    fn configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }

    fn actions(&self) -> Option<&dyn ActionProvider> {
        Some(self)
    }

    fn extensions(&self) -> Option<&dyn ExtensionProvider> {
        self.chat_hook.then_some(self as &dyn ExtensionProvider)
    }
}

#[async_trait]
impl Lifecycle for TestPlugin {
    async fn activate(&self) -> Result<HookOutcome> {
        self.journal.record(format!("activate:{}", self.id));
        match self.activation {
            Activation::Accept => Ok(HookOutcome::Accepted),
            Activation::Decline => Ok(HookOutcome::declined("not ready")),
            Activation::Fail => Err(PluginError::ConfigError("missing api key".to_string())),
            Activation::Panic => panic!("activation exploded"),
        }
    }

    async fn deactivate(&self) -> Result<HookOutcome> {
        self.journal.record(format!("deactivate:{}", self.id));
        Ok(HookOutcome::Accepted)
    }

    async fn uninstall(&self) -> Result<()> {
        self.journal.record(format!("uninstall:{}", self.id));
        Ok(())
    }
}

#[async_trait]
impl Configurable for TestPlugin {
    async fn update_configuration(&self, values: &ConfigMap) -> Result<HookOutcome> {
        self.journal
            .applied
            .lock()
            .insert(self.id.clone(), values.clone());
        Ok(HookOutcome::Accepted)
    }

    fn default_config(&self) -> ConfigMap {
        self.defaults.clone()
    }
}

#[async_trait]
impl ActionProvider for TestPlugin {
    fn action_names(&self) -> Vec<String> {
        vec!["echo".to_string(), "fail".to_string(), "explode".to_string()]
    }

    async fn invoke(&self, action: &str, args: Vec<Value>) -> Result<Value> {
        match action {
            "echo" => Ok(Value::Array(args)),
            "fail" => Err(PluginError::ConfigError("bad input".to_string())),
            "explode" => panic!("callee exploded"),
            other => Err(PluginError::method_not_found(&self.id, other)),
        }
    }
}

impl ExtensionProvider for TestPlugin {
    fn chat_ui_extension(&self) -> Option<ChatUiExtension> {
        let hook: MessageHook = Arc::new(|message: &str, _role: &str| Some(message.to_uppercase()));
        Some(ChatUiExtension {
            location: "sidebar".to_string(),
            title: "Shout".to_string(),
            components: vec![UiComponent::new("shout_toggle", "toggle")],
            message_hook: Some(hook),
        })
    }
}

/// Temporary host home with a catalog and a config store on disk.
pub struct Harness {
    pub tmp: TempDir,
    pub journal: Arc<Journal>,
    pub store: Arc<JsonConfigStore>,
    pub catalog: Arc<PluginCatalog>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let store = JsonConfigStore::open(tmp.path().join("config.json")).unwrap();
        Self {
            tmp,
            journal: Arc::new(Journal::default()),
            store: Arc::new(store),
            catalog: Arc::new(PluginCatalog::new()),
        }
    }

    pub fn paths(&self) -> HostPaths {
        HostPaths::under(self.tmp.path())
    }

    pub fn factory(&self, name: &str) -> TestFactory {
        TestFactory::new(name, self.journal.clone())
    }

    /// Create `<plugin_dir>/<id>/plugin.toml` pointing at `entry`.
    pub fn install_dir(&self, id: &str, entry: &str) {
        let dir = self.paths().plugin_path(id).unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), format!("entry = \"{entry}\"\n")).unwrap();
    }

    /// Install a plugin directory and register its factory under the same
    /// name.
    pub fn add(&self, id: &str, factory: TestFactory) -> Arc<TestFactory> {
        self.install_dir(id, id);
        let factory = Arc::new(factory);
        self.catalog.register(id, factory.clone());
        factory
    }

    /// Manager over this home, with discovery already run.
    pub async fn manager(&self) -> PluginManager {
        let host = HostContext::new(self.paths(), self.store.clone())
            .with_host_version(Version::new(0, 3, 0));
        let manager = PluginManager::new(Arc::new(host), self.catalog.clone());
        manager.discover().await;
        manager
    }
}
