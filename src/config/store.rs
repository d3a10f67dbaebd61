//! Live configuration store with file persistence and change notification

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::settings::{ConfigFormat, GatewayConfig, ServiceDeclaration};
use crate::error::{GatewayError, Result};

/// Receives every configuration that becomes current
pub trait ConfigWatcher: Send + Sync + 'static {
    fn on_config_changed(&self, config: &GatewayConfig) -> Result<()>;
}

impl<F> ConfigWatcher for F
where
    F: Fn(&GatewayConfig) -> Result<()> + Send + Sync + 'static,
{
    fn on_config_changed(&self, config: &GatewayConfig) -> Result<()> {
        self(config)
    }
}

/// Holds the current [`GatewayConfig`] and keeps it in sync with a file.
///
/// Readers get an immutable snapshot; a reload or update swaps the whole
/// value at once.
pub struct ConfigStore {
    path: PathBuf,
    format: ConfigFormat,
    current: ArcSwap<GatewayConfig>,
    last_modified: Mutex<Option<SystemTime>>,
    watchers: RwLock<Vec<Arc<dyn ConfigWatcher>>>,
    from_file: bool,
}

impl ConfigStore {
    /// Load configuration from `path`. A missing file falls back to the
    /// built-in configuration; a malformed or invalid one is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let format = ConfigFormat::from_path(&path)?;

        let (config, modified, from_file) = match std::fs::metadata(&path) {
            Ok(meta) => {
                let config = GatewayConfig::from_file(&path)?;
                (config, meta.modified().ok(), true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using built-in configuration");
                (GatewayConfig::builtin(), None, false)
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            services = config.services.len(),
            "Configuration loaded"
        );

        Ok(Self {
            path,
            format,
            current: ArcSwap::from_pointee(config),
            last_modified: Mutex::new(modified),
            watchers: RwLock::new(Vec::new()),
            from_file,
        })
    }

    /// Wrap an in-memory configuration. Updates are still persisted to `path`.
    pub fn with_config<P: AsRef<Path>>(path: P, mut config: GatewayConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let format = ConfigFormat::from_path(&path)?;
        config.validate()?;
        config.apply_defaults();

        Ok(Self {
            path,
            format,
            current: ArcSwap::from_pointee(config),
            last_modified: Mutex::new(None),
            watchers: RwLock::new(Vec::new()),
            from_file: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the current configuration originated from the file
    pub fn loaded_from_file(&self) -> bool {
        self.from_file
    }

    /// Current configuration snapshot
    pub fn get(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Replace the configuration: validate, fill defaults, persist, swap and
    /// notify watchers. Nothing changes when validation or the write fails.
    pub fn update(&self, mut config: GatewayConfig) -> Result<()> {
        config.validate()?;
        config.apply_defaults();
        self.persist(&config)?;

        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();
        *self.last_modified.lock() = modified;

        let config = Arc::new(config);
        self.current.store(Arc::clone(&config));
        info!(path = %self.path.display(), "Configuration updated");

        self.notify(config);
        Ok(())
    }

    /// Register a watcher for future configuration changes
    pub fn add_watcher<W: ConfigWatcher>(&self, watcher: W) {
        self.watchers.write().push(Arc::new(watcher));
    }

    /// Re-read the file if its modification time moved.
    ///
    /// Returns `Ok(true)` when a new configuration became current and
    /// `Ok(false)` when there was nothing to do. On a parse or validation
    /// error the previous configuration stays active.
    pub fn reload(&self) -> Result<bool> {
        let modified = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        {
            let mut last = self.last_modified.lock();
            if modified.is_some() && *last == modified {
                return Ok(false);
            }
            // a broken file is reported once, not on every tick
            *last = modified;
        }

        let config = GatewayConfig::from_file(&self.path)?;
        if *self.current.load_full() == config {
            debug!(path = %self.path.display(), "Config file touched without changes");
            return Ok(false);
        }

        let config = Arc::new(config);
        self.current.store(Arc::clone(&config));
        info!(path = %self.path.display(), "Configuration reloaded");

        self.notify(config);
        Ok(true)
    }

    /// Poll the file every `interval` until `token` is cancelled
    pub fn spawn_reload_task(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.reload() {
                            error!(path = %store.path.display(), error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }

            debug!("Config reload task stopped");
        })
    }

    /// Declaration of one service in the current configuration
    pub fn service(&self, name: &str) -> Option<ServiceDeclaration> {
        self.current.load().services.get(name).cloned()
    }

    /// Add or replace a service declaration
    pub fn add_service(&self, name: &str, service: ServiceDeclaration) -> Result<()> {
        let mut config = (*self.get()).clone();
        config.services.insert(name.to_string(), service);
        self.update(config)
    }

    /// Remove a service declaration
    pub fn remove_service(&self, name: &str) -> Result<()> {
        let mut config = (*self.get()).clone();
        if config.services.remove(name).is_none() {
            return Err(GatewayError::ServiceNotFound(name.to_string()));
        }
        self.update(config)
    }

    fn persist(&self, config: &GatewayConfig) -> Result<()> {
        let content = config.render(self.format)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn notify(&self, config: Arc<GatewayConfig>) {
        let watchers = self.watchers.read().clone();

        for watcher in watchers {
            let config = Arc::clone(&config);
            let run = move || {
                if let Err(e) = watcher.on_config_changed(&config) {
                    warn!(error = %e, "Config watcher failed");
                }
            };

            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { run() });
                }
                Err(_) => run(),
            }
        }
    }
}
