//! Persisted operator defaults
//!
//! A JSON file remembering the last used kind, target, thread count and
//! upstream proxy, plus a few preferences. The store is created explicitly
//! with a path; nothing here is global.

use crate::proxy::manager::DEFAULT_TARGET;
use crate::proxy::models::ProxyKind;
use crate::proxy::parser::ExportFormat;
use crate::proxy::probe::UpstreamProxy;
use crate::Result;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SETTINGS_DIR: &str = "soxy-check";
const SETTINGS_FILE: &str = "settings.json";

/// Persisted defaults; unknown or missing fields fall back to the defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub last_kind: ProxyKind,
    pub last_endpoint: String,
    pub last_thread_count: usize,
    /// Empty when no upstream is used
    pub last_upstream_proxy: String,
    pub last_upstream_kind: ProxyKind,
    /// Targets offered to the operator
    pub default_endpoints: Vec<String>,
    pub max_threads: usize,
    pub theme: String,
    pub export_format: ExportFormat,
    pub auto_save_results: bool,
    pub auto_save_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            last_kind: ProxyKind::Http,
            last_endpoint: DEFAULT_TARGET.to_string(),
            last_thread_count: 20,
            last_upstream_proxy: String::new(),
            last_upstream_kind: ProxyKind::Http,
            default_endpoints: vec![
                "https://api.ipify.org".to_string(),
                "https://ifconfig.me/ip".to_string(),
                "https://icanhazip.com".to_string(),
                "https://ipinfo.io/ip".to_string(),
                "https://checkip.amazonaws.com".to_string(),
            ],
            max_threads: 100,
            theme: "system".to_string(),
            export_format: ExportFormat::Plain,
            auto_save_results: false,
            auto_save_path: String::new(),
        }
    }
}

impl Settings {
    /// Clamp a requested thread count to `1..=max_threads`
    pub fn clamp_threads(&self, threads: usize) -> usize {
        threads.clamp(1, self.max_threads.max(1))
    }

    /// The remembered upstream proxy, if any
    pub fn upstream(&self) -> Option<UpstreamProxy> {
        let address = self.last_upstream_proxy.trim();
        if address.is_empty() {
            None
        } else {
            Some(UpstreamProxy::new(address, self.last_upstream_kind))
        }
    }
}

/// Settings bound to a file on disk
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    /// `soxy-check/settings.json` under the platform config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(SETTINGS_DIR)
            .join(SETTINGS_FILE)
    }

    /// Read settings from `path`; a missing file yields the defaults
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings file {}", path.display()))?;
            serde_json::from_str(&data)
                .with_context(|| format!("failed to parse settings file {}", path.display()))?
        } else {
            debug!(path = %path.display(), "no settings file, using defaults");
            Settings::default()
        };
        Ok(Self { path, settings })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create settings directory {}", dir.display()))?;
            }
        }
        let data = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.path, data)
            .with_context(|| format!("failed to write settings file {}", self.path.display()))?;
        Ok(())
    }

    /// Apply `updater` and persist the result
    pub fn update<F>(&mut self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        updater(&mut self.settings);
        self.settings.last_thread_count = self.settings.clamp_threads(self.settings.last_thread_count);
        self.save()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("soxy-settings-{}", uuid::Uuid::new_v4()))
            .join(SETTINGS_FILE)
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let store = SettingsStore::load(temp_path()).unwrap();
        assert_eq!(store.settings(), &Settings::default());
        assert_eq!(store.settings().max_threads, 100);
        assert_eq!(store.settings().default_endpoints.len(), 5);
        assert!(store.settings().upstream().is_none());
    }

    #[test]
    fn test_update_persists_and_clamps() {
        let path = temp_path();
        let mut store = SettingsStore::load(&path).unwrap();
        store
            .update(|s| {
                s.last_kind = ProxyKind::Socks5;
                s.last_thread_count = 500;
                s.last_upstream_proxy = "10.0.0.1:3128".to_string();
                s.export_format = ExportFormat::Json;
            })
            .unwrap();

        let reloaded = SettingsStore::load(&path).unwrap();
        assert_eq!(reloaded.settings().last_kind, ProxyKind::Socks5);
        assert_eq!(reloaded.settings().last_thread_count, 100);
        assert_eq!(reloaded.settings().export_format, ExportFormat::Json);
        assert_eq!(
            reloaded.settings().upstream(),
            Some(UpstreamProxy::new("10.0.0.1:3128", ProxyKind::Http))
        );

        if let Some(dir) = path.parent() {
            fs::remove_dir_all(dir).unwrap();
        }
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"lastKind":"socks4","exportFormat":"with-kind"}"#).unwrap();

        let store = SettingsStore::load(&path).unwrap();
        assert_eq!(store.settings().last_kind, ProxyKind::Socks4);
        assert_eq!(store.settings().export_format, ExportFormat::WithKind);
        assert_eq!(store.settings().last_endpoint, DEFAULT_TARGET);

        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();
        assert!(SettingsStore::load(&path).is_err());
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_default_path_under_config_dir() {
        let path = SettingsStore::default_path();
        assert!(path.ends_with(Path::new(SETTINGS_DIR).join(SETTINGS_FILE)));
        if let Some(config) = dirs::config_dir() {
            assert!(path.starts_with(config));
        }
    }

    #[test]
    fn test_clamp_threads() {
        let settings = Settings::default();
        assert_eq!(settings.clamp_threads(0), 1);
        assert_eq!(settings.clamp_threads(42), 42);
        assert_eq!(settings.clamp_threads(1000), 100);
    }
}
