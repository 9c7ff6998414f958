//! Dependency checks and dependency-aware ordering.

use std::collections::{HashMap, VecDeque};

use indexmap::IndexMap;
use semver::{Version, VersionReq};
use serde::Serialize;

use crate::plugin::PluginDependencies;

/// Key used for the host version requirement.
pub const HOST_KEY: &str = "host";

/// Prefix of plugin dependency keys.
pub const PLUGIN_PREFIX: &str = "plugin:";

/// Satisfaction of each declared dependency, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DependencyReport {
    entries: IndexMap<String, bool>,
}

impl DependencyReport {
    pub fn get(&self, key: &str) -> Option<bool> {
        self.entries.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether every declared dependency is met.
    pub fn is_satisfied(&self) -> bool {
        self.entries.values().all(|ok| *ok)
    }

    /// Keys of unmet dependencies.
    pub fn missing(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Check `deps` against the running host.
///
/// `is_active` reports whether another plugin is loaded and active.
pub fn check_dependencies(
    deps: &PluginDependencies,
    host_version: &Version,
    is_active: impl Fn(&str) -> bool,
) -> DependencyReport {
    let mut entries = IndexMap::new();

    if let Some(req) = &deps.host {
        let ok = match VersionReq::parse(req) {
            Ok(req) => req.matches(host_version),
            Err(e) => {
                tracing::warn!("Invalid host version requirement '{}': {}", req, e);
                false
            }
        };
        entries.insert(HOST_KEY.to_string(), ok);
    }

    for tool in &deps.external_tools {
        entries.insert(tool.clone(), which::which(tool).is_ok());
    }

    for plugin in &deps.plugins {
        entries.insert(format!("{PLUGIN_PREFIX}{plugin}"), is_active(plugin));
    }

    DependencyReport { entries }
}

/// Order plugin ids so declared plugin dependencies come first.
///
/// Dependencies outside `plugins` are ignored. Ties keep input order.
/// Plugins caught in a cycle are appended in input order after a warning.
pub fn activation_order(plugins: &[(String, Vec<String>)]) -> Vec<String> {
    let index: HashMap<&str, usize> = plugins
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; plugins.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); plugins.len()];

    for (i, (_, deps)) in plugins.iter().enumerate() {
        for dep in deps {
            if let Some(&j) = index.get(dep.as_str()) {
                if i != j {
                    in_degree[i] += 1;
                    dependents[j].push(i);
                }
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..plugins.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut placed = vec![false; plugins.len()];
    let mut order = Vec::with_capacity(plugins.len());

    while let Some(i) = queue.pop_front() {
        placed[i] = true;
        order.push(plugins[i].0.clone());
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                queue.push_back(d);
            }
        }
    }

    if order.len() != plugins.len() {
        let stuck: Vec<&str> = plugins
            .iter()
            .enumerate()
            .filter(|(i, _)| !placed[*i])
            .map(|(_, (id, _))| id.as_str())
            .collect();
        tracing::warn!("Dependency cycle between plugins: {}", stuck.join(", "));
        order.extend(stuck.into_iter().map(String::from));
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, deps: &[&str]) -> (String, Vec<String>) {
        (id.to_string(), deps.iter().map(|d| d.to_string()).collect())
    }

    #[test]
    fn test_check_host_and_plugins() {
        let deps = PluginDependencies {
            host: Some(">=0.3".into()),
            external_tools: Vec::new(),
            plugins: vec!["base".into(), "extra".into()],
        };
        let report = check_dependencies(&deps, &Version::new(0, 3, 1), |id| id == "base");

        assert_eq!(report.get(HOST_KEY), Some(true));
        assert_eq!(report.get("plugin:base"), Some(true));
        assert_eq!(report.get("plugin:extra"), Some(false));
        assert!(!report.is_satisfied());
        assert_eq!(report.missing(), vec!["plugin:extra"]);
    }

    #[test]
    fn test_host_requirement_mismatch() {
        let deps = PluginDependencies {
            host: Some("^2".into()),
            ..Default::default()
        };
        let report = check_dependencies(&deps, &Version::new(0, 3, 0), |_| true);
        assert_eq!(report.get(HOST_KEY), Some(false));

        let bad = PluginDependencies {
            host: Some("not a requirement".into()),
            ..Default::default()
        };
        let report = check_dependencies(&bad, &Version::new(0, 3, 0), |_| true);
        assert_eq!(report.get(HOST_KEY), Some(false));
    }

    #[test]
    fn test_missing_external_tool() {
        let deps = PluginDependencies {
            external_tools: vec!["irintai-definitely-not-installed".into()],
            ..Default::default()
        };
        let report = check_dependencies(&deps, &Version::new(0, 3, 0), |_| true);
        assert_eq!(report.get("irintai-definitely-not-installed"), Some(false));
    }

    #[test]
    fn test_empty_dependencies() {
        let report = check_dependencies(&PluginDependencies::default(), &Version::new(1, 0, 0), |_| false);
        assert!(report.is_empty());
        assert!(report.is_satisfied());
    }

    #[test]
    fn test_activation_order() {
        let order = activation_order(&[
            entry("ui", &["core", "theme"]),
            entry("theme", &["core"]),
            entry("core", &[]),
            entry("solo", &["not-installed"]),
        ]);
        assert_eq!(order, vec!["core", "solo", "theme", "ui"]);
    }

    #[test]
    fn test_cycle_is_broken() {
        let order = activation_order(&[
            entry("a", &["b"]),
            entry("b", &["a"]),
            entry("c", &[]),
        ]);
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}
