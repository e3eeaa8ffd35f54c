use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::settings::types::PreviewSettings;

/// Environment variable overriding the settings file location.
pub const SETTINGS_PATH_ENV: &str = "EDGEVIEWER_SETTINGS";

const DEFAULT_FILE_NAME: &str = "edgeviewer.json";

const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SettingsError + '_ {
    move |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Persistent settings store with debounced saving.
pub struct SettingsStore {
    path: PathBuf,
    data: Mutex<PreviewSettings>,
    save_notify: Notify,
    is_dirty: AtomicBool,
}

impl SettingsStore {
    /// Create a new store, loading from disk if the file exists. An
    /// unreadable file is logged and replaced by defaults on the next save.
    pub fn new(path: PathBuf) -> Self {
        let data = Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings, using defaults: {e}");
            PreviewSettings::default()
        });
        Self {
            path,
            data: Mutex::new(data),
            save_notify: Notify::new(),
            is_dirty: AtomicBool::new(false),
        }
    }

    /// `$EDGEVIEWER_SETTINGS`, or `edgeviewer.json` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os(SETTINGS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings from a JSON file, returning default on missing file.
    pub fn load(path: &Path) -> Result<PreviewSettings, SettingsError> {
        if !path.exists() {
            return Ok(PreviewSettings::default());
        }
        let contents = std::fs::read_to_string(path).map_err(io_error(path))?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save current settings to disk atomically (write .tmp then rename).
    pub fn save(&self) -> Result<(), SettingsError> {
        let data = self.data.lock().clone();
        let json = serde_json::to_string_pretty(&data)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json).map_err(io_error(&tmp_path))?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_error(&self.path))?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }

    /// Save now if anything changed since the last save.
    pub fn flush(&self) -> Result<(), SettingsError> {
        if self.is_dirty.swap(false, Ordering::AcqRel) {
            self.save()?;
        }
        Ok(())
    }

    pub fn get(&self) -> PreviewSettings {
        self.data.lock().clone()
    }

    /// Modify settings in memory. Triggers a debounced save.
    pub fn update(&self, change: impl FnOnce(&mut PreviewSettings)) {
        change(&mut *self.data.lock());
        self.is_dirty.store(true, Ordering::Release);
        self.save_notify.notify_one();
    }

    pub fn set_filters(&self, grayscale: bool, edges: bool) {
        self.update(|s| {
            s.grayscale = grayscale;
            s.edges = edges;
        });
    }

    /// Start the debounce task: waits for dirty notification, sleeps 500ms, then saves.
    ///
    /// Uses an `AtomicBool` dirty flag to avoid losing notifications that arrive
    /// between `save()` completing and `notified().await` re-registering.
    /// Must be called from within a tokio runtime.
    pub fn start_debounce_task(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.save_notify.notified().await;
                tokio::time::sleep(SAVE_DEBOUNCE).await;
                if store.is_dirty.swap(false, Ordering::AcqRel) {
                    if let Err(e) = store.save() {
                        tracing::warn!("Failed to save settings: {e}");
                    }
                }
            }
        })
    }
}
