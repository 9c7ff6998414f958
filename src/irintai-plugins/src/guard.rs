//! Failure containment for calls into plugin code.
//!
//! Plugins run in the host process. Errors they return are passed through
//! unchanged; panics are caught here and turned into
//! [`PluginError::Panicked`] so they never unwind into host code.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::FutureExt;

use crate::{PluginError, Result};

/// Await a plugin future, converting a panic into an error.
pub async fn contain<T, F>(plugin_id: &str, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panicked(plugin_id, operation, payload.as_ref())),
    }
}

/// Run a synchronous plugin callback, converting a panic into an error.
pub fn contain_sync<T, F>(plugin_id: &str, operation: &str, f: F) -> Result<T>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| panicked(plugin_id, operation, payload.as_ref()))
}

fn panicked(plugin_id: &str, operation: &str, payload: &(dyn Any + Send)) -> PluginError {
    let message = panic_message(payload);
    tracing::error!(plugin = plugin_id, operation, "Plugin panicked: {}", message);
    PluginError::Panicked {
        plugin: plugin_id.to_string(),
        message,
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contain_passes_through() {
        let ok = contain("p", "op", async { Ok::<_, PluginError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = contain("p", "op", async {
            Err::<(), _>(PluginError::ConfigError("bad".into()))
        })
        .await;
        assert!(matches!(err, Err(PluginError::ConfigError(_))));
    }

    async fn explode() -> Result<()> {
        panic!("kaboom")
    }

    #[tokio::test]
    async fn test_contain_catches_panic() {
        let result = contain("p", "activate", explode()).await;
        match result {
            Err(PluginError::Panicked { plugin, message }) => {
                assert_eq!(plugin, "p");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_contain_sync() {
        assert_eq!(contain_sync("p", "get", || 3).unwrap(), 3);

        let value = 42;
        let result: Result<()> = contain_sync("p", "get", || panic!("bad value {value}"));
        assert!(matches!(result, Err(PluginError::Panicked { message, .. }) if message == "bad value 42"));
    }
}
