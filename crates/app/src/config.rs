//! Settings file and data directory locations.

use anyhow::{Context, Result};
use shared::settings::AppSettings;
use std::path::{Path, PathBuf};
use tracing::warn;

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com.local", "Percepta", "Percepta")
}

/// `<config dir>/settings.json`
pub fn config_path() -> Option<PathBuf> {
    project_dirs().map(|p| p.config_dir().join("settings.json"))
}

/// Where conversation records are written, one JSON file each
pub fn conversations_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().join("conversations"))
        .unwrap_or_else(|| PathBuf::from("./conversations"))
}

/// Load settings from `path`. Missing fields take their defaults.
pub fn load_settings_from(path: &Path) -> Result<AppSettings> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

/// Load settings from disk or return defaults. The flag is true when a
/// settings file was found and parsed.
pub fn load_settings_or_default() -> (AppSettings, bool) {
    let Some(path) = config_path() else {
        return (AppSettings::default(), false);
    };
    if !path.exists() {
        return (AppSettings::default(), false);
    }
    match load_settings_from(&path) {
        Ok(settings) => (settings, true),
        Err(e) => {
            warn!("ignoring unreadable settings: {:#}", e);
            (AppSettings::default(), false)
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

/// Write the settings file so users have something to edit
pub fn save_settings(settings: &AppSettings) -> Result<()> {
    let path = config_path().context("no config directory on this platform")?;
    save_settings_to(&path, settings)
}
