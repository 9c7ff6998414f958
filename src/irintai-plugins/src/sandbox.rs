//! File operations confined to a plugin's own directories.
//!
//! A plugin may read and write below its data and config directories and
//! read below the shared resources directory. Paths are normalized
//! lexically before the containment check, so `..` cannot climb out.
//! Every operation fails closed: a refused or failed call logs a warning
//! and returns `false`, `None` or an empty list.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

/// Subdirectory of the data directory used for temporary files.
pub const TEMP_DIR: &str = "temp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Information about a file inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub is_dir: bool,
    pub readonly: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Sandboxed file access for one plugin.
#[derive(Debug, Clone)]
pub struct SandboxedFileOps {
    plugin_id: String,
    data_dir: PathBuf,
    config_dir: PathBuf,
    shared_dir: Option<PathBuf>,
}

impl SandboxedFileOps {
    pub fn new(
        plugin_id: impl Into<String>,
        data_dir: impl AsRef<Path>,
        config_dir: impl AsRef<Path>,
        shared_dir: Option<&Path>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            data_dir: absolute(data_dir.as_ref()),
            config_dir: absolute(config_dir.as_ref()),
            shared_dir: shared_dir.map(absolute),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn shared_dir(&self) -> Option<&Path> {
        self.shared_dir.as_deref()
    }

    /// Resolve `path` against the data directory and normalize it. Returns
    /// `None` when it falls outside every allowed root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Option<PathBuf> {
        let resolved = self.normalize(path.as_ref());
        self.access_of(&resolved).map(|_| resolved)
    }

    fn normalize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.data_dir.join(path))
        }
    }

    fn access_of(&self, path: &Path) -> Option<Access> {
        if path.starts_with(&self.data_dir) || path.starts_with(&self.config_dir) {
            Some(Access::Write)
        } else if self.shared_dir.as_ref().is_some_and(|s| path.starts_with(s)) {
            Some(Access::Read)
        } else {
            None
        }
    }

    /// Containment plus permission check. `must_exist` only applies to reads.
    async fn checked(&self, path: &Path, wanted: Access, must_exist: bool) -> Option<PathBuf> {
        let resolved = self.normalize(path);
        let Some(granted) = self.access_of(&resolved) else {
            tracing::warn!(
                plugin = %self.plugin_id,
                "Access denied outside plugin directories: {}",
                resolved.display()
            );
            return None;
        };
        if wanted == Access::Write && granted == Access::Read {
            tracing::warn!(
                plugin = %self.plugin_id,
                "Write refused on read-only path: {}",
                resolved.display()
            );
            return None;
        }

        match tokio::fs::metadata(&resolved).await {
            Ok(meta) => {
                if wanted == Access::Write && meta.permissions().readonly() {
                    tracing::warn!(
                        plugin = %self.plugin_id,
                        "No write permission for path: {}",
                        resolved.display()
                    );
                    return None;
                }
            }
            Err(_) if must_exist => {
                tracing::warn!(
                    plugin = %self.plugin_id,
                    "Path does not exist: {}",
                    resolved.display()
                );
                return None;
            }
            Err(_) => {}
        }
        Some(resolved)
    }

    async fn create_parent(&self, path: &Path) -> bool {
        let Some(parent) = path.parent() else {
            return true;
        };
        match tokio::fs::create_dir_all(parent).await {
            Ok(()) => true,
            Err(e) => {
                self.failed("create directory", parent, &e);
                false
            }
        }
    }

    fn failed(&self, what: &str, path: &Path, err: &dyn std::fmt::Display) {
        tracing::warn!(
            plugin = %self.plugin_id,
            "Failed to {} {}: {}",
            what,
            path.display(),
            err
        );
    }

    /// Read a UTF-8 file.
    pub async fn read(&self, path: impl AsRef<Path>) -> Option<String> {
        let path = self.checked(path.as_ref(), Access::Read, true).await?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) => {
                self.failed("read", &path, &e);
                None
            }
        }
    }

    /// Read raw bytes.
    pub async fn read_bytes(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let path = self.checked(path.as_ref(), Access::Read, true).await?;
        match tokio::fs::read(&path).await {
            Ok(content) => Some(content),
            Err(e) => {
                self.failed("read", &path, &e);
                None
            }
        }
    }

    /// Write a file, replacing any existing content. Parent directories are
    /// created.
    pub async fn write(&self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> bool {
        let Some(path) = self.checked(path.as_ref(), Access::Write, false).await else {
            return false;
        };
        if !self.create_parent(&path).await {
            return false;
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => true,
            Err(e) => {
                self.failed("write", &path, &e);
                false
            }
        }
    }

    /// Append to a file, creating it if needed.
    pub async fn append(&self, path: impl AsRef<Path>, content: impl AsRef<[u8]>) -> bool {
        let Some(path) = self.checked(path.as_ref(), Access::Write, false).await else {
            return false;
        };
        if !self.create_parent(&path).await {
            return false;
        }
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(content.as_ref()).await?;
            file.flush().await
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                self.failed("append to", &path, &e);
                false
            }
        }
    }

    /// Create a directory and its parents.
    pub async fn ensure_dir(&self, path: impl AsRef<Path>) -> bool {
        let Some(path) = self.checked(path.as_ref(), Access::Write, false).await else {
            return false;
        };
        match tokio::fs::create_dir_all(&path).await {
            Ok(()) => true,
            Err(e) => {
                self.failed("create directory", &path, &e);
                false
            }
        }
    }

    /// Files below `dir`, recursively and sorted. With `extensions`, only
    /// names ending in one of them are kept.
    pub async fn list_files(&self, dir: impl AsRef<Path>, extensions: &[&str]) -> Vec<PathBuf> {
        let Some(root) = self.checked(dir.as_ref(), Access::Read, true).await else {
            return Vec::new();
        };

        let mut files = Vec::new();
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.failed("list", &dir, &e);
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                match entry.file_type().await {
                    Ok(ft) if ft.is_dir() => pending.push(path),
                    Ok(_) => {
                        let name = entry.file_name();
                        let name = name.to_string_lossy();
                        if extensions.is_empty() || extensions.iter().any(|ext| name.ends_with(ext))
                        {
                            files.push(path);
                        }
                    }
                    Err(_) => {}
                }
            }
        }
        files.sort();
        files
    }

    pub async fn file_info(&self, path: impl AsRef<Path>) -> Option<FileInfo> {
        let path = self.checked(path.as_ref(), Access::Read, true).await?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => {
                self.failed("stat", &path, &e);
                return None;
            }
        };
        Some(FileInfo {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            extension: path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
            size: meta.len(),
            is_dir: meta.is_dir(),
            readonly: meta.permissions().readonly() || self.access_of(&path) == Some(Access::Read),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            path,
        })
    }

    pub async fn load_json<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Option<T> {
        let content = self.read(path.as_ref()).await?;
        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                self.failed("parse JSON in", path.as_ref(), &e);
                None
            }
        }
    }

    pub async fn save_json<T: Serialize + ?Sized>(&self, path: impl AsRef<Path>, value: &T) -> bool {
        match serde_json::to_string_pretty(value) {
            Ok(content) => self.write(path, content).await,
            Err(e) => {
                self.failed("serialize JSON for", path.as_ref(), &e);
                false
            }
        }
    }

    /// Copy a file. The source may be read-only, the destination may not.
    pub async fn copy(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> bool {
        let Some(from) = self.checked(from.as_ref(), Access::Read, true).await else {
            return false;
        };
        let Some(to) = self.checked(to.as_ref(), Access::Write, false).await else {
            return false;
        };
        if !self.create_parent(&to).await {
            return false;
        }
        match tokio::fs::copy(&from, &to).await {
            Ok(_) => true,
            Err(e) => {
                self.failed("copy", &from, &e);
                false
            }
        }
    }

    /// Move a file. Both ends must be writable.
    pub async fn move_file(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> bool {
        let Some(from) = self.checked(from.as_ref(), Access::Write, true).await else {
            return false;
        };
        let Some(to) = self.checked(to.as_ref(), Access::Write, false).await else {
            return false;
        };
        if !self.create_parent(&to).await {
            return false;
        }
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => true,
            Err(_) => {
                // Cross-device: fall back to copy and remove.
                match tokio::fs::copy(&from, &to).await {
                    Ok(_) => tokio::fs::remove_file(&from).await.is_ok(),
                    Err(e) => {
                        self.failed("move", &from, &e);
                        false
                    }
                }
            }
        }
    }

    /// Delete a file or directory tree. The sandbox roots themselves are
    /// never removed.
    pub async fn delete(&self, path: impl AsRef<Path>) -> bool {
        let Some(path) = self.checked(path.as_ref(), Access::Write, true).await else {
            return false;
        };
        if path == self.data_dir || path == self.config_dir {
            tracing::warn!(
                plugin = %self.plugin_id,
                "Refusing to delete sandbox root {}",
                path.display()
            );
            return false;
        }
        let result = if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.failed("delete", &path, &e);
                false
            }
        }
    }

    /// Create a uniquely named file under `<data_dir>/temp`.
    pub async fn create_temp_file(&self, suffix: Option<&str>, content: &str) -> Option<PathBuf> {
        let name = format!(
            "{}_{}{}",
            self.plugin_id,
            uuid::Uuid::new_v4().simple(),
            suffix.unwrap_or(".tmp")
        );
        let path = self.data_dir.join(TEMP_DIR).join(name);
        self.write(&path, content).await.then_some(path)
    }

    /// Remove temporary files older than `max_age`. Returns how many were
    /// deleted.
    pub async fn cleanup_temp_files(&self, max_age: Duration) -> usize {
        let temp_dir = self.data_dir.join(TEMP_DIR);
        if tokio::fs::metadata(&temp_dir).await.is_err() {
            return 0;
        }
        let cutoff = SystemTime::now().checked_sub(max_age).unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0;
        for file in self.list_files(&temp_dir, &[]).await {
            let stale = tokio::fs::metadata(&file)
                .await
                .and_then(|m| m.modified())
                .is_ok_and(|modified| modified < cutoff);
            if stale && self.delete(&file).await {
                removed += 1;
            }
        }
        removed
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_default();
        normalize(&cwd.join(path))
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the
/// filesystem. `..` never climbs above the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
