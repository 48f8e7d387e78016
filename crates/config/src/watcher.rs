//! File watcher driving configuration hot reload

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Watches one or more configuration files for changes
pub struct ConfigWatcher {
    paths: Vec<PathBuf>,
    _watcher: RecommendedWatcher,
    rx: Receiver<Result<Event, notify::Error>>,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(paths: &[P]) -> Result<Self, notify::Error> {
        let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
        let (tx, rx) = channel();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        let mut watched_dirs: Vec<&Path> = Vec::new();
        for path in &paths {
            let dir = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            if !watched_dirs.contains(&dir) {
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
                watched_dirs.push(dir);
            }
        }

        info!(paths = ?paths, "Configuration watcher started");

        Ok(Self {
            paths,
            _watcher: watcher,
            rx,
        })
    }

    /// Drain pending events, returning the watched files that changed
    pub fn poll(&self) -> Vec<PathBuf> {
        let mut changed = Vec::new();

        while let Ok(result) = self.rx.try_recv() {
            match result {
                Ok(event) => {
                    for path in self.relevant_paths(&event) {
                        debug!(path = ?path, kind = ?event.kind, "Configuration file event");
                        if !changed.contains(&path) {
                            changed.push(path);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            }
        }

        changed
    }

    fn relevant_paths(&self, event: &Event) -> Vec<PathBuf> {
        if !matches!(
            event.kind,
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
        ) {
            return Vec::new();
        }

        self.paths
            .iter()
            .filter(|watched| {
                event.paths.iter().any(|p| {
                    p == *watched || (p.file_name().is_some() && p.file_name() == watched.file_name())
                })
            })
            .cloned()
            .collect()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

/// Polls a [`ConfigWatcher`] and invokes a callback with changed files.
///
/// Events arriving within one debounce interval are coalesced so an editor
/// writing a file in several steps triggers a single reload.
pub struct ReloadManager {
    watcher: ConfigWatcher,
    debounce: Duration,
}

impl ReloadManager {
    pub fn new<P: AsRef<Path>>(paths: &[P]) -> Result<Self, notify::Error> {
        Ok(Self {
            watcher: ConfigWatcher::new(paths)?,
            debounce: Duration::from_millis(500),
        })
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start the reload loop; it exits when `shutdown` flips to true
    pub fn start<F>(self, mut shutdown: watch::Receiver<bool>, callback: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&Path) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.debounce);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for path in self.watcher.poll() {
                            info!(path = ?path, "Configuration change detected, triggering reload");
                            callback(&path);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Configuration watcher stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn modify_event(path: PathBuf) -> Event {
        Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            paths: vec![path],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_watcher_creation() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gatehouse.toml");
        fs::write(&config_path, "").unwrap();

        assert!(ConfigWatcher::new(&[&config_path]).is_ok());
    }

    #[test]
    fn test_relevant_paths() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gatehouse.toml");
        let root_path = temp_dir.path().join("root_config.json");
        fs::write(&config_path, "").unwrap();
        fs::write(&root_path, "{}").unwrap();

        let watcher = ConfigWatcher::new(&[&config_path, &root_path]).unwrap();

        assert_eq!(
            watcher.relevant_paths(&modify_event(root_path.clone())),
            vec![root_path]
        );
        assert!(watcher
            .relevant_paths(&modify_event(temp_dir.path().join("other.toml")))
            .is_empty());
    }

    #[test]
    fn test_access_events_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gatehouse.toml");
        fs::write(&config_path, "").unwrap();

        let watcher = ConfigWatcher::new(&[&config_path]).unwrap();
        let event = Event {
            kind: EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![config_path],
            attrs: Default::default(),
        };
        assert!(watcher.relevant_paths(&event).is_empty());
    }

    #[tokio::test]
    async fn test_reload_manager_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("gatehouse.toml");
        fs::write(&config_path, "").unwrap();

        let (tx, rx) = watch::channel(false);
        let manager = ReloadManager::new(&[&config_path])
            .unwrap()
            .with_debounce(Duration::from_millis(20));
        let handle = manager.start(rx, |_| {});

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
