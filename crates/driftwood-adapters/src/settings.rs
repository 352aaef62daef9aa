//! Settings management for driftwood
//!
//! Stores settings in ~/.config/driftwood/settings.json

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub const DEFAULT_WISP_SERVER: &str = "wss://anura.pro/";
const WISP_SERVER_ENV: &str = "DRIFTWOOD_WISP_SERVER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Wisp server every tunneled request goes through
    #[serde(default = "default_wisp_server")]
    pub wisp_server: String,
    /// Engine version whose artifact is currently cached
    #[serde(default)]
    pub engine_version: String,
    /// Session token for the Shipwrecked API
    #[serde(default)]
    pub token: Option<String>,
}

fn default_wisp_server() -> String {
    DEFAULT_WISP_SERVER.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wisp_server: default_wisp_server(),
            engine_version: String::new(),
            token: None,
        }
    }
}

impl Settings {
    fn sanitize(&mut self) {
        self.wisp_server = self.wisp_server.trim().to_string();
        if self.wisp_server.is_empty() {
            self.wisp_server = default_wisp_server();
        }
        if self.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.token = None;
        }
    }

    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("driftwood"))
    }

    /// Get the settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from disk, or return default
    pub fn load_from(path: &Path) -> Self {
        if let Ok(content) = fs::read_to_string(path) {
            match serde_json::from_str::<Settings>(&content) {
                Ok(mut settings) => {
                    settings.sanitize();
                    return settings;
                }
                Err(err) => {
                    preserve_corrupt_settings(path, &content);
                    tracing::warn!(
                        path = %path.display(),
                        "settings file was corrupted ({err}); a backup was saved and defaults were loaded"
                    );
                }
            }
        }
        Self::default()
    }

    /// Save settings to disk
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut sanitized = self.clone();
        sanitized.sanitize();

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create settings directory")?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                    tracing::debug!("failed to set settings directory permissions: {e}");
                }
            }
        }

        let content =
            serde_json::to_string_pretty(&sanitized).context("Failed to serialize settings")?;
        write_settings_atomic(path, &content).context("Failed to write settings")?;
        Ok(())
    }
}

/// Settings shared between the tunnel, the session layer and the CLI.
///
/// Reads are cheap snapshots. Every `update` is persisted immediately when the
/// store is backed by a file.
#[derive(Debug, Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Settings>>,
    path: Option<Arc<PathBuf>>,
    wisp_override: Option<Arc<str>>,
}

impl SharedSettings {
    /// Load from the default location, honoring `DRIFTWOOD_WISP_SERVER`.
    pub fn load() -> Self {
        let mut shared = match Settings::default_path() {
            Some(path) => Self::open(path),
            None => Self::in_memory(Settings::default()),
        };
        shared.wisp_override = std::env::var(WISP_SERVER_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(Arc::from);
        shared
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            inner: Arc::new(RwLock::new(Settings::load_from(&path))),
            path: Some(Arc::new(path)),
            wisp_override: None,
        }
    }

    pub fn in_memory(settings: Settings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
            path: None,
            wisp_override: None,
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn wisp_server(&self) -> String {
        if let Some(url) = &self.wisp_override {
            return url.to_string();
        }
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .wisp_server
            .clone()
    }

    pub fn engine_version(&self) -> String {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .engine_version
            .clone()
    }

    pub fn token(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .token
            .clone()
    }

    /// Apply a change and persist it.
    pub fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let snapshot = {
            let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
            change(&mut guard);
            guard.sanitize();
            guard.clone()
        };
        match self.path.as_deref() {
            Some(path) => snapshot.save_to(path),
            None => Ok(()),
        }
    }

    /// Get the settings file location for display
    pub fn location(&self) -> String {
        self.path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(in memory)".to_string())
    }
}

fn preserve_corrupt_settings(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_settings_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            tracing::debug!("failed to set temp settings file permissions: {e}");
        }
    }

    file.write_all(content.as_bytes())?;
    file.sync_all()?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}
