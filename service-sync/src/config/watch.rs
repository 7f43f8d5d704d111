//! Hot reload of the configuration file.
//!
//! The parent directory is watched rather than the file itself: ConfigMap
//! volumes update by swapping a `..data` symlink, which replaces the file
//! instead of writing to it.

use super::{ConfigHandle, SyncConfig, load_config};
use crate::error::{SyncError, SyncResult};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Quiet period before a burst of file events triggers a reload.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Symlink swapped by the kubelet when a ConfigMap volume changes.
const CONFIGMAP_DATA_LINK: &str = "..data";

/// Watches the configuration file and swaps new snapshots into a [`ConfigHandle`].
///
/// Dropping the watcher stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`, reloading into `handle` on change.
    pub fn spawn(path: impl Into<PathBuf>, handle: ConfigHandle) -> SyncResult<Self> {
        let path = path.into();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                SyncError::InvalidConfig(format!("config path has no file name: {}", path.display()))
            })?
            .to_os_string();

        let (tx, mut rx) = mpsc::channel::<()>(1);

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if touches_config(&event, &file_name) {
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Config watcher error"),
            })
            .map_err(|e| SyncError::Io(format!("failed to create config watcher: {}", e)))?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                SyncError::Io(format!(
                    "failed to watch config directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;

        tracing::info!(path = %path.display(), "Watching configuration for changes");

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                reload(&path, &handle);
            }
            tracing::debug!("Config change channel closed");
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn touches_config(event: &Event, file_name: &OsStr) -> bool {
    if event.kind.is_access() {
        return false;
    }
    event.paths.iter().any(|p| {
        p.file_name()
            .is_some_and(|name| name == file_name || name == CONFIGMAP_DATA_LINK)
    })
}

/// Reload the file into `handle`, keeping the previous snapshot on failure.
///
/// `runMode` and `listenAddress` keep their running values.
fn reload(path: &Path, handle: &ConfigHandle) {
    match load_config(path) {
        Ok(mut next) => {
            let current = handle.snapshot();
            warn_restart_required(&current, &next);
            next.run_mode = current.run_mode;
            next.listen_address = current.listen_address;
            tracing::info!(
                path = %path.display(),
                peers = next.peers.len(),
                namespaces = next.sync_namespaces.len(),
                "Configuration reloaded"
            );
            tracing::debug!(config = ?next, "New configuration");
            handle.replace(next);
        }
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Configuration reload failed, keeping previous configuration"
            );
        }
    }
}

fn warn_restart_required(current: &SyncConfig, next: &SyncConfig) {
    if current.run_mode != next.run_mode {
        tracing::warn!(
            current = %current.run_mode,
            configured = %next.run_mode,
            "runMode changed; restart required for it to take effect"
        );
    }
    if current.listen_address != next.listen_address {
        tracing::warn!(
            current = %current.listen_address,
            configured = %next.listen_address,
            "listenAddress changed; restart required for it to take effect"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use notify::EventKind;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::io::Write;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn matches_file_and_data_link() {
        let name = OsStr::new("config.yaml");
        assert!(touches_config(
            &event(EventKind::Modify(ModifyKind::Any), "/defaults/config.yaml"),
            name
        ));
        assert!(touches_config(
            &event(EventKind::Create(CreateKind::Any), "/defaults/..data"),
            name
        ));
        assert!(!touches_config(
            &event(EventKind::Modify(ModifyKind::Any), "/defaults/other.yaml"),
            name
        ));
        assert!(!touches_config(
            &event(EventKind::Access(AccessKind::Any), "/defaults/config.yaml"),
            name
        ));
    }

    #[test]
    fn reload_replaces_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"runMode: controller\npeers: [http://peer-a:8080]\n")
            .unwrap();

        let handle = ConfigHandle::new(SyncConfig::new(RunMode::Controller));
        reload(file.path(), &handle);

        assert_eq!(handle.snapshot().peers, vec!["http://peer-a:8080"]);
    }

    #[test]
    fn reload_keeps_startup_only_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"runMode: target\nlistenAddress: 127.0.0.1:9999\nlogLevel: debug\n")
            .unwrap();

        let handle = ConfigHandle::new(SyncConfig::new(RunMode::Sync));
        let listen = handle.snapshot().listen_address;
        reload(file.path(), &handle);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.run_mode, RunMode::Sync);
        assert_eq!(snapshot.listen_address, listen);
        assert_eq!(snapshot.log_level, "debug");
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"runMode: [not, a, mode]\n").unwrap();

        let mut current = SyncConfig::new(RunMode::Controller);
        current.peers.push("http://peer-a:8080".into());
        let handle = ConfigHandle::new(current);

        reload(file.path(), &handle);

        assert_eq!(handle.snapshot().peers, vec!["http://peer-a:8080"]);
    }

    #[tokio::test]
    async fn file_change_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "runMode: controller\n").unwrap();

        let handle = ConfigHandle::new(load_config(&path).unwrap());
        let mut rx = handle.subscribe();
        let _watcher = ConfigWatcher::spawn(&path, handle.clone()).unwrap();

        std::fs::write(&path, "runMode: controller\nsyncNamespaces: [shop]\n").unwrap();

        tokio::time::timeout(Duration::from_secs(10), rx.changed())
            .await
            .expect("reload within timeout")
            .unwrap();
        assert!(handle.snapshot().allows_namespace("shop"));
    }
}
