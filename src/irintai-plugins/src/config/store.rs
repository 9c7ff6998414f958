//! Host configuration store.

use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::ConfigMap;
use crate::{PluginError, Result};

/// Key/value configuration owned by the host.
///
/// Keys are flat strings. The plugin core uses three conventions on top of
/// it: a nested `plugins` object keyed by plugin id, legacy
/// `plugins.<id>.<key>` entries and top-level objects keyed by plugin id.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value);

    fn remove(&self, key: &str) -> Option<Value>;

    /// Copy of every entry.
    fn snapshot(&self) -> ConfigMap;

    /// Persist to the backing medium.
    fn save(&self) -> Result<()>;
}

/// A [`ConfigStore`] kept as one JSON object on disk.
#[derive(Debug, Default)]
pub struct JsonConfigStore {
    path: Option<PathBuf>,
    values: RwLock<ConfigMap>,
    // Held from snapshot to rename so an older snapshot never lands last.
    save_lock: Mutex<()>,
}

impl JsonConfigStore {
    /// Open the store at `path`. A missing file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => ConfigMap::new(),
            Ok(content) => match serde_json::from_str::<Value>(&content)? {
                Value::Object(map) => map,
                _ => {
                    return Err(PluginError::ConfigError(format!(
                        "{} does not contain a JSON object",
                        path.display()
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Opened config store at {:?} ({} keys)", path, values.len());
        Ok(Self {
            path: Some(path),
            values: RwLock::new(values),
            save_lock: Mutex::new(()),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// In-memory store seeded with values.
    pub fn from_map(values: ConfigMap) -> Self {
        Self {
            path: None,
            values: RwLock::new(values),
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    fn snapshot(&self) -> ConfigMap {
        self.values.read().clone()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _guard = self.save_lock.lock();
        let content = serde_json::to_string_pretty(&*self.values.read())?;
        write_atomic(path, content.as_bytes())?;
        tracing::debug!("Saved config store to {:?}", path);
        Ok(())
    }
}

/// Write through a uniquely named sibling temp file and rename over the
/// target.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);
    if let Err(e) = std::fs::write(&tmp, contents) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}
