//! Update checks against a plugin's `update_url`.
//!
//! The URL is expected to serve a small JSON document:
//!
//! ```json
//! { "version": "1.2.0", "download_url": "https://...", "changelog": "..." }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::guard;
use crate::plugin::PluginMetadata;
use crate::{PluginError, Result};

/// Timeout for fetching an update manifest.
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

const USER_AGENT: &str = concat!("irintai-plugins/", env!("CARGO_PKG_VERSION"));

/// Result of an update check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub has_update: bool,
    pub current_version: String,
    pub latest_version: String,
    pub update_url: Option<String>,
    pub changelog: Option<String>,
}

impl UpdateInfo {
    /// "No update" for a plugin currently at `version`.
    pub fn current(version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            has_update: false,
            latest_version: version.clone(),
            current_version: version,
            update_url: None,
            changelog: None,
        }
    }
}

/// Plugin-provided update check. Returning `Ok(None)` falls back to
/// fetching the metadata `update_url`.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn check_for_updates(&self) -> Result<Option<UpdateInfo>>;
}

#[derive(Debug, Deserialize)]
struct ReleaseManifest {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    changelog: Option<String>,
}

/// Fetches and compares update manifests.
#[derive(Debug, Clone)]
pub struct UpdateChecker {
    client: reqwest::Client,
}

impl UpdateChecker {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(UPDATE_TIMEOUT)
            .build()
            .map_err(|e| PluginError::UpdateError {
                plugin: String::new(),
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    /// Check `plugin_id` for updates. Failures are logged and reported as
    /// "no update"; this never errors.
    pub async fn check(
        &self,
        plugin_id: &str,
        metadata: &PluginMetadata,
        source: Option<&dyn UpdateSource>,
    ) -> UpdateInfo {
        let mut info = UpdateInfo::current(&metadata.version);

        let Some(update_url) = metadata.update_url.as_deref() else {
            return info;
        };

        if let Some(source) = source {
            match guard::contain(plugin_id, "check_for_updates", source.check_for_updates()).await
            {
                Ok(Some(reported)) => return reported,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Failed to check updates for {}: {}", plugin_id, e);
                    return info;
                }
            }
        }

        match self.fetch(plugin_id, update_url).await {
            Ok(manifest) => {
                let latest = manifest.version.unwrap_or_else(|| "0.0.0".to_string());
                if is_newer(&latest, &metadata.version) {
                    tracing::info!(
                        "Update available for {}: {} -> {}",
                        plugin_id,
                        metadata.version,
                        latest
                    );
                    info.has_update = true;
                    info.update_url = manifest.download_url;
                    info.changelog = manifest.changelog;
                }
                info.latest_version = latest;
            }
            Err(e) => tracing::warn!("Failed to check updates for {}: {}", plugin_id, e),
        }
        info
    }

    async fn fetch(&self, plugin_id: &str, update_url: &str) -> Result<ReleaseManifest> {
        let url = url::Url::parse(update_url)
            .map_err(|e| PluginError::update_error(plugin_id, format!("invalid update URL: {e}")))?;

        tracing::debug!(plugin = plugin_id, url = %url, "Fetching update manifest");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PluginError::update_error(plugin_id, e.to_string()))?;

        response
            .json::<ReleaseManifest>()
            .await
            .map_err(|e| PluginError::update_error(plugin_id, format!("invalid manifest: {e}")))
    }
}

/// Parse a version, accepting the short `1` and `1.2` forms.
pub fn parse_version(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(v) = semver::Version::parse(raw) {
        return Some(v);
    }
    let parts = raw.split('.').count();
    let padded = match parts {
        1 => format!("{raw}.0.0"),
        2 => format!("{raw}.0"),
        _ => return None,
    };
    semver::Version::parse(&padded).ok()
}

/// Whether `latest` is strictly newer than `current`. Unparsable versions
/// never count as newer.
pub fn is_newer(latest: &str, current: &str) -> bool {
    match (parse_version(latest), parse_version(current)) {
        (Some(latest), Some(current)) => latest > current,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metadata(update_url: Option<String>) -> PluginMetadata {
        let mut meta = PluginMetadata::new("Notes", "1.0.0");
        meta.update_url = update_url;
        meta
    }

    #[test]
    fn test_version_comparison() {
        assert!(is_newer("1.1.0", "1.0.0"));
        assert!(is_newer("2", "1.9.9"));
        assert!(is_newer("v1.0.1", "1.0"));
        assert!(!is_newer("1.0.0", "1.0.0"));
        assert!(!is_newer("garbage", "1.0.0"));
        assert!(!is_newer("1.0.0-beta", "1.0.0"));
    }

    #[tokio::test]
    async fn test_no_update_url() {
        let checker = UpdateChecker::new().unwrap();
        let info = checker.check("notes", &metadata(None), None).await;
        assert_eq!(info, UpdateInfo::current("1.0.0"));
    }

    #[tokio::test]
    async fn test_fetches_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/notes.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "version": "1.2.0",
                "download_url": "https://example.org/notes-1.2.0.zip",
                "changelog": "Faster search"
            })))
            .mount(&server)
            .await;

        let checker = UpdateChecker::new().unwrap();
        let meta = metadata(Some(format!("{}/notes.json", server.uri())));
        let info = checker.check("notes", &meta, None).await;

        assert!(info.has_update);
        assert_eq!(info.latest_version, "1.2.0");
        assert_eq!(info.changelog.as_deref(), Some("Faster search"));
    }

    #[tokio::test]
    async fn test_server_error_means_no_update() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let checker = UpdateChecker::new().unwrap();
        let meta = metadata(Some(server.uri()));
        let info = checker.check("notes", &meta, None).await;
        assert!(!info.has_update);
        assert_eq!(info.latest_version, "1.0.0");
    }

    struct Pinned;

    #[async_trait]
    impl UpdateSource for Pinned {
        async fn check_for_updates(&self) -> Result<Option<UpdateInfo>> {
            Ok(Some(UpdateInfo {
                has_update: true,
                current_version: "1.0.0".into(),
                latest_version: "9.9.9".into(),
                update_url: None,
                changelog: None,
            }))
        }
    }

    #[tokio::test]
    async fn test_plugin_source_wins() {
        let checker = UpdateChecker::new().unwrap();
        let meta = metadata(Some("http://127.0.0.1:9/unreachable".into()));
        let info = checker.check("notes", &meta, Some(&Pinned)).await;
        assert_eq!(info.latest_version, "9.9.9");
    }
}
