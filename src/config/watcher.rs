//! Hot reload of the configuration file.
//!
//! Editors often emit several modify events per save, so a reload is only
//! forwarded when the parsed configuration differs from the last one sent.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::GatewayConfig;

/// Turns file events into validated, de-duplicated configurations.
struct Reloader {
    path: PathBuf,
    last: Mutex<Option<GatewayConfig>>,
    updates: mpsc::UnboundedSender<GatewayConfig>,
}

impl Reloader {
    /// Returns true when a new configuration was forwarded.
    fn on_event(&self, event: &Event) -> bool {
        if !(event.kind.is_modify() || event.kind.is_create()) {
            return false;
        }

        let new_config = match load_config(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(
                    path = ?self.path,
                    error = %e,
                    "Failed to reload config, keeping current configuration"
                );
                return false;
            }
        };

        let mut last = self.last.lock().expect("config reloader mutex poisoned");
        if last.as_ref() == Some(&new_config) {
            tracing::debug!(path = ?self.path, "Config file touched without changes");
            return false;
        }
        *last = Some(new_config.clone());
        drop(last);

        tracing::info!(path = ?self.path, "Config file changed, applying");
        self.updates.send(new_config).is_ok()
    }
}

/// Watches one configuration file.
pub struct ConfigWatcher {
    reloader: Reloader,
}

impl ConfigWatcher {
    /// Returns the watcher and the receiver for changed configurations.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<GatewayConfig>) {
        let (updates, rx) = mpsc::unbounded_channel();
        // The file as loaded at startup is the baseline.
        let baseline = load_config(path).ok();
        let reloader = Reloader {
            path: path.to_path_buf(),
            last: Mutex::new(baseline),
            updates,
        };
        (Self { reloader }, rx)
    }

    /// Start watching. Dropping the returned watcher stops it.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let path = self.reloader.path.clone();
        let reloader = self.reloader;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    reloader.on_event(&event);
                }
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}
