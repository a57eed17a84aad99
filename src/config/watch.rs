//! File-driven configuration reload.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use super::GatewayConfig;
use crate::{Error, ErrorContext, Result};

/// Watches one YAML file and publishes each successfully parsed snapshot on
/// a [`watch`] channel. A file edit that fails to parse keeps the previous
/// snapshot — a broken save never tears down running clients.
pub struct ConfigWatcher {
    receiver: watch::Receiver<Arc<GatewayConfig>>,
    // Dropped with the watcher; keeps the OS watch alive.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let initial = Arc::new(GatewayConfig::from_yaml_file(&path)?);
        let (tx, rx) = watch::channel(initial);

        let reload_path = path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match GatewayConfig::from_yaml_file(&reload_path) {
                        Ok(config) => {
                            let _ = tx.send(Arc::new(config));
                        }
                        Err(e) => {
                            warn!(path = %reload_path.display(), error = %e, "config reload failed, keeping previous snapshot");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "config watcher error");
                }
            },
        )
        .map_err(|e| watch_error(e, &path))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| watch_error(e, &path))?;

        Ok(Self {
            receiver: rx,
            _watcher: watcher,
        })
    }

    /// Subscribe to snapshot updates. The factory passes this receiver to
    /// [`ClientFactory::subscribe_updates`](crate::factory::ClientFactory::subscribe_updates).
    pub fn subscribe(&self) -> watch::Receiver<Arc<GatewayConfig>> {
        self.receiver.clone()
    }

    /// The snapshot most recently loaded from disk.
    pub fn current(&self) -> Arc<GatewayConfig> {
        self.receiver.borrow().clone()
    }
}

fn watch_error(e: notify::Error, path: &Path) -> Error {
    Error::configuration_with_context(
        format!("cannot watch config file: {}", e),
        ErrorContext::new()
            .with_details(path.display().to_string())
            .with_source("config_watcher"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
clients:
  main:
    base_url: "https://api.example.com/v1"
    model: gpt-4o
    api_key: sk-test
"#;

    #[tokio::test]
    async fn loads_initial_snapshot() {
        let dir = std::env::temp_dir().join(format!("modelgate-watch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("gateway.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(MINIMAL.as_bytes()).unwrap();
        drop(f);

        let watcher = ConfigWatcher::new(&path).unwrap();
        assert!(watcher.current().get("main").is_some());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_file_is_a_configuration_error() {
        let err = ConfigWatcher::new("/nonexistent/modelgate.yaml").err().unwrap();
        assert!(matches!(
            err,
            Error::Io(_) | Error::Configuration { .. }
        ));
    }
}
