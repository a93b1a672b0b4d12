use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use eyre::{Result, WrapErr, eyre};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::GatewayConfig},
    ports::config_provider::ConfigProvider,
};

/// Config file on local disk, watched for changes.
///
/// The parent directory is watched rather than the file: editors and mounted config
/// volumes replace the file instead of writing it in place.
pub struct FileConfigProvider {
    path: PathBuf,
    _watcher: RecommendedWatcher,
    changes: Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (tx, rx) = mpsc::channel(1);
        let watcher = watch_file(&path, tx)?;
        Ok(Self {
            path,
            _watcher: watcher,
            changes: Mutex::new(Some(rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_change_of(event: &Event, file_name: &OsString) -> bool {
    let kind = event.kind;
    (kind.is_modify() || kind.is_create() || kind.is_remove())
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

fn watch_file(path: &Path, tx: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
    let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Config path {} does not name a file", path.display()))?
        .to_owned();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_change_of(&event, &file_name) => {
            tracing::debug!(kind = ?event.kind, "Config file changed");
            // a full channel already holds a pending reload
            let _ = tx.try_send(());
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Config watch error"),
    })
    .wrap_err("Failed to create config watcher")?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .wrap_err_with(|| format!("Failed to watch {}", dir.display()))?;
    Ok(watcher)
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let path = self
            .path
            .to_str()
            .ok_or_else(|| eyre!("Config path {} is not UTF-8", self.path.display()))?;
        load_config(path).await
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        match self.changes.lock() {
            Ok(mut changes) => changes.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn bundle_config(script: &str) -> String {
        format!(
            r#"
listen_addr: "127.0.0.1:8080"
routing:
  js_bundles:
    - name: devops
      link: /dist/devops/index.js
      source:
        raw: "{script}"
"#
        )
    }

    #[tokio::test]
    async fn test_file_config_provider_signals_routing_changes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("junction.yaml");
        std::fs::write(&path, bundle_config("console.log('v1')"))?;

        let provider = FileConfigProvider::new(&path)?;
        let config = provider.load_config().await?;
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.routing.js_bundles.len(), 1);

        let mut changes = provider.watch().expect("first watch call returns the receiver");
        assert!(provider.watch().is_none());

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, bundle_config("console.log('v2')"))?;

        let signal = tokio::time::timeout(Duration::from_secs(2), changes.recv())
            .await
            .expect("timed out waiting for the change signal");
        assert!(signal.is_some());

        let config = provider.load_config().await?;
        assert_eq!(
            config.routing.js_bundles[0].source.raw.as_deref(),
            Some("console.log('v2')")
        );
        Ok(())
    }

    #[test]
    fn test_path_without_file_name_is_rejected() {
        assert!(FileConfigProvider::new("/").is_err());
    }
}
