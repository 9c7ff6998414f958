//! Resource monitor: plugin-registered metrics and monitored processes.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::guard;

/// Callback returning the current value of a metric.
pub type MetricGetter = Arc<dyn Fn() -> Value + Send + Sync>;

/// How a metric is displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricFormat {
    #[default]
    Numeric,
    Percentage,
    Text,
}

/// Display metadata for a plugin metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMetadata {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub format: MetricFormat,
    /// Only meaningful for numeric metrics
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    #[serde(default)]
    pub min: f64,
    #[serde(default = "default_max")]
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_threshold: Option<f64>,
}

fn default_max() -> f64 {
    100.0
}

impl MetricMetadata {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            format: MetricFormat::Numeric,
            unit: String::new(),
            min: 0.0,
            max: default_max(),
            warning_threshold: Some(70.0),
            critical_threshold: Some(90.0),
        }
    }

    /// Set the format. A unit only sticks to numeric metrics.
    pub fn with_format(mut self, format: MetricFormat) -> Self {
        self.format = format;
        if format != MetricFormat::Numeric {
            self.unit.clear();
        }
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        if self.format == MetricFormat::Numeric {
            self.unit = unit.into();
        }
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

/// Current value of one plugin metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub plugin_id: String,
    pub metric_id: String,
    pub value: Option<Value>,
    pub previous: Option<Value>,
    pub metadata: MetricMetadata,
    /// The getter failed and `value` is the last good one
    pub stale: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Current state of one monitored process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSample {
    pub plugin_id: String,
    pub pid: u32,
    pub name: String,
    pub running: bool,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Host-wide usage snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub plugin_metrics: usize,
    pub monitored_processes: usize,
}

struct MetricEntry {
    plugin_id: String,
    metric_id: String,
    getter: MetricGetter,
    metadata: MetricMetadata,
    last_value: Option<Value>,
    last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ProcessEntry {
    plugin_id: String,
    pid: u32,
    name: String,
    unregister_on_exit: bool,
}

/// `(plugin_id, metric_id)`
type MetricKey = (String, String);
/// `(plugin_id, pid)`
type ProcessKey = (String, u32);

/// Tracks metrics and processes registered by plugins.
pub struct ResourceMonitor {
    metrics: RwLock<BTreeMap<MetricKey, MetricEntry>>,
    processes: RwLock<BTreeMap<ProcessKey, ProcessEntry>>,
    system: Mutex<System>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            metrics: RwLock::new(BTreeMap::new()),
            processes: RwLock::new(BTreeMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    // ========== Metrics ==========

    /// Register or replace a metric.
    pub fn register_metric(
        &self,
        plugin_id: &str,
        metric_id: &str,
        getter: MetricGetter,
        metadata: MetricMetadata,
    ) -> bool {
        self.metrics.write().insert(
            metric_key(plugin_id, metric_id),
            MetricEntry {
                plugin_id: plugin_id.to_string(),
                metric_id: metric_id.to_string(),
                getter,
                metadata,
                last_value: None,
                last_update: None,
            },
        );
        tracing::debug!("Registered custom metric: {}.{}", plugin_id, metric_id);
        true
    }

    /// Returns `false` if the metric was not registered.
    pub fn unregister_metric(&self, plugin_id: &str, metric_id: &str) -> bool {
        let removed = self
            .metrics
            .write()
            .remove(&metric_key(plugin_id, metric_id))
            .is_some();
        if removed {
            tracing::debug!("Unregistered custom metric: {}.{}", plugin_id, metric_id);
        }
        removed
    }

    pub fn unregister_plugin_metrics(&self, plugin_id: &str) -> usize {
        let mut metrics = self.metrics.write();
        let before = metrics.len();
        metrics.retain(|_, m| m.plugin_id != plugin_id);
        let count = before - metrics.len();
        if count > 0 {
            tracing::debug!("Unregistered {} metrics for plugin {}", count, plugin_id);
        }
        count
    }

    /// Metric ids registered by a plugin.
    pub fn plugin_metrics(&self, plugin_id: &str) -> Vec<String> {
        self.metrics
            .read()
            .values()
            .filter(|m| m.plugin_id == plugin_id)
            .map(|m| m.metric_id.clone())
            .collect()
    }

    /// Sample one metric. A failing getter yields its last good value.
    pub fn metric_value(&self, plugin_id: &str, metric_id: &str) -> Option<Value> {
        self.sample_metric(&metric_key(plugin_id, metric_id))
            .and_then(|s| s.value)
    }

    /// Sample every registered metric.
    pub fn sample_metrics(&self) -> Vec<MetricSample> {
        let keys: Vec<MetricKey> = self.metrics.read().keys().cloned().collect();
        keys.iter().filter_map(|k| self.sample_metric(k)).collect()
    }

    fn sample_metric(&self, key: &MetricKey) -> Option<MetricSample> {
        let (plugin_id, getter) = {
            let metrics = self.metrics.read();
            let entry = metrics.get(key)?;
            (entry.plugin_id.clone(), entry.getter.clone())
        };

        // The getter runs without the lock held so it may call back in.
        let result = guard::contain_sync(&plugin_id, "metric", || getter());

        let mut metrics = self.metrics.write();
        let entry = metrics.get_mut(key)?;
        let previous = entry.last_value.clone();
        let stale = match result {
            Ok(value) => {
                entry.last_value = Some(value);
                entry.last_update = Some(Utc::now());
                false
            }
            Err(e) => {
                tracing::error!("Error getting metric {}.{}: {}", key.0, key.1, e);
                true
            }
        };

        Some(MetricSample {
            plugin_id: entry.plugin_id.clone(),
            metric_id: entry.metric_id.clone(),
            value: entry.last_value.clone(),
            previous,
            metadata: entry.metadata.clone(),
            stale,
            updated_at: entry.last_update,
        })
    }

    // ========== Processes ==========

    /// Start monitoring `pid` for a plugin. Fails if the process does not
    /// exist.
    pub fn register_process(&self, plugin_id: &str, pid: u32, name: Option<&str>) -> bool {
        let Some(sample) = self.probe_process(pid) else {
            tracing::warn!("Cannot monitor PID {} for {}: no such process", pid, plugin_id);
            return false;
        };

        let name = name.map(str::to_string).unwrap_or(sample.0);
        tracing::debug!(
            "Registered process monitor for {} (PID: {}) from plugin {}",
            name,
            pid,
            plugin_id
        );
        self.processes.write().insert(
            process_key(plugin_id, pid),
            ProcessEntry {
                plugin_id: plugin_id.to_string(),
                pid,
                name,
                unregister_on_exit: true,
            },
        );
        true
    }

    /// Returns `false` if the process was not registered.
    pub fn unregister_process(&self, plugin_id: &str, pid: u32) -> bool {
        self.processes
            .write()
            .remove(&process_key(plugin_id, pid))
            .is_some()
    }

    pub fn unregister_plugin_processes(&self, plugin_id: &str) -> usize {
        let mut processes = self.processes.write();
        let before = processes.len();
        processes.retain(|_, p| p.plugin_id != plugin_id);
        before - processes.len()
    }

    /// PIDs monitored for a plugin.
    pub fn plugin_processes(&self, plugin_id: &str) -> Vec<u32> {
        self.processes
            .read()
            .values()
            .filter(|p| p.plugin_id == plugin_id)
            .map(|p| p.pid)
            .collect()
    }

    /// Sample one monitored process. Exited processes are dropped from
    /// monitoring and reported as not running.
    pub fn process_metrics(&self, plugin_id: &str, pid: u32) -> Option<ProcessSample> {
        let key = process_key(plugin_id, pid);
        let entry = self.processes.read().get(&key).cloned()?;

        match self.probe_process(pid) {
            Some((_, cpu_percent, memory_bytes)) => Some(ProcessSample {
                plugin_id: entry.plugin_id,
                pid,
                name: entry.name,
                running: true,
                cpu_percent,
                memory_bytes,
            }),
            None => {
                if entry.unregister_on_exit {
                    self.processes.write().remove(&key);
                    tracing::info!("Monitored process {} ({}) exited", entry.name, pid);
                }
                Some(ProcessSample {
                    plugin_id: entry.plugin_id,
                    pid,
                    name: entry.name,
                    running: false,
                    cpu_percent: 0.0,
                    memory_bytes: 0,
                })
            }
        }
    }

    /// Sample every monitored process.
    pub fn sample_processes(&self) -> Vec<ProcessSample> {
        let entries: Vec<ProcessEntry> = self.processes.read().values().cloned().collect();
        entries
            .iter()
            .filter_map(|e| self.process_metrics(&e.plugin_id, e.pid))
            .collect()
    }

    /// Host-wide CPU and memory usage.
    pub fn system_stats(&self) -> SystemStats {
        let (cpu_percent, memory_used_bytes, memory_total_bytes) = {
            let mut system = self.system.lock();
            system.refresh_cpu_usage();
            system.refresh_memory();
            (
                system.global_cpu_usage(),
                system.used_memory(),
                system.total_memory(),
            )
        };

        SystemStats {
            cpu_percent,
            memory_used_bytes,
            memory_total_bytes,
            plugin_metrics: self.metrics.read().len(),
            monitored_processes: self.processes.read().len(),
        }
    }

    /// Drop everything a plugin registered.
    pub fn forget_plugin(&self, plugin_id: &str) {
        self.unregister_plugin_metrics(plugin_id);
        self.unregister_plugin_processes(plugin_id);
    }

    fn probe_process(&self, pid: u32) -> Option<(String, f32, u64)> {
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| {
            (
                OsStr::new(p.name()).to_string_lossy().into_owned(),
                p.cpu_usage(),
                p.memory(),
            )
        })
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("metrics", &self.metrics.read().len())
            .field("processes", &self.processes.read().len())
            .finish()
    }
}

fn metric_key(plugin_id: &str, metric_id: &str) -> MetricKey {
    (plugin_id.to_string(), metric_id.to_string())
}

fn process_key(plugin_id: &str, pid: u32) -> ProcessKey {
    (plugin_id.to_string(), pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_metric_registration_is_idempotent() {
        let monitor = ResourceMonitor::new();
        let getter: MetricGetter = Arc::new(|| json!(1));
        let meta = MetricMetadata::new("Queue", "Queued items");

        assert!(monitor.register_metric("notes", "queue", getter.clone(), meta.clone()));
        assert!(monitor.register_metric("notes", "queue", getter, meta));
        assert_eq!(monitor.plugin_metrics("notes"), vec!["queue"]);

        assert!(monitor.unregister_metric("notes", "queue"));
        assert!(!monitor.unregister_metric("notes", "queue"));
    }

    #[test]
    fn test_metric_sampling() {
        let monitor = ResourceMonitor::new();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        monitor.register_metric(
            "notes",
            "count",
            Arc::new(move || json!(c.fetch_add(1, Ordering::SeqCst))),
            MetricMetadata::new("Count", "Calls"),
        );

        assert_eq!(monitor.metric_value("notes", "count"), Some(json!(0)));
        let samples = monitor.sample_metrics();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, Some(json!(1)));
        assert_eq!(samples[0].previous, Some(json!(0)));
        assert!(!samples[0].stale);
    }

    #[test]
    fn test_panicking_getter_is_contained() {
        let monitor = ResourceMonitor::new();
        monitor.register_metric(
            "bad",
            "boom",
            Arc::new(|| -> Value { panic!("getter exploded") }),
            MetricMetadata::new("Boom", "Always fails"),
        );

        assert_eq!(monitor.metric_value("bad", "boom"), None);
        assert!(monitor.sample_metrics()[0].stale);
    }

    #[test]
    fn test_unit_only_for_numeric() {
        let meta = MetricMetadata::new("Load", "Load")
            .with_format(MetricFormat::Percentage)
            .with_unit("ms");
        assert!(meta.unit.is_empty());

        let meta = MetricMetadata::new("Latency", "Latency").with_unit("ms");
        assert_eq!(meta.unit, "ms");
    }

    #[test]
    fn test_process_registration() {
        let monitor = ResourceMonitor::new();
        let pid = std::process::id();

        assert!(monitor.register_process("notes", pid, Some("self")));
        let sample = monitor.process_metrics("notes", pid).unwrap();
        assert!(sample.running);
        assert_eq!(sample.name, "self");

        assert_eq!(monitor.unregister_plugin_processes("notes"), 1);
        assert!(!monitor.unregister_process("notes", pid));
        assert!(monitor.process_metrics("notes", pid).is_none());
    }

    #[test]
    fn test_dotted_ids_do_not_collide() {
        let monitor = ResourceMonitor::new();
        let meta = MetricMetadata::new("M", "M");
        monitor.register_metric("a.b", "c", Arc::new(|| json!("first")), meta.clone());
        monitor.register_metric("a", "b.c", Arc::new(|| json!("second")), meta);

        assert_eq!(monitor.sample_metrics().len(), 2);
        assert_eq!(monitor.metric_value("a.b", "c"), Some(json!("first")));
        assert_eq!(monitor.metric_value("a", "b.c"), Some(json!("second")));

        assert!(monitor.unregister_metric("a", "b.c"));
        assert_eq!(monitor.plugin_metrics("a.b"), vec!["c"]);
    }

    #[test]
    fn test_forget_plugin() {
        let monitor = ResourceMonitor::new();
        monitor.register_metric(
            "a",
            "m",
            Arc::new(|| json!(null)),
            MetricMetadata::new("M", "M"),
        );
        monitor.register_metric(
            "b",
            "m",
            Arc::new(|| json!(null)),
            MetricMetadata::new("M", "M"),
        );
        monitor.forget_plugin("a");
        assert!(monitor.plugin_metrics("a").is_empty());
        assert_eq!(monitor.plugin_metrics("b"), vec!["m"]);
    }
}
