//! General application settings as a free-form key/value mapping.
//!
//! Unknown keys are preserved, so older and newer versions can share one
//! file. A handful of keys have typed accessors with defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_yaml::Value;
use tracing::error;

use crate::registry::DEFAULT_TIMEOUT_MS;

/// Default upper bound for the command history.
pub const DEFAULT_COMMAND_LIMIT: usize = 500;

/// Free-form application settings backed by one YAML mapping.
pub struct Settings {
    values: BTreeMap<String, Value>,
    path: PathBuf,
}

impl Settings {
    /// Load settings from the default path.
    pub fn load() -> Self {
        match super::settings_path() {
            Some(path) => Self::load_from_path(&path),
            None => Self {
                values: Self::defaults(),
                path: PathBuf::new(),
            },
        }
    }

    /// Load settings from a specific path.
    ///
    /// A missing, empty or broken file yields the defaults; settings are
    /// never a reason to fail startup.
    pub fn load_from_path(path: &Path) -> Self {
        let mut values = match std::fs::read_to_string(path) {
            Ok(content) => {
                match serde_yaml::from_str::<Option<BTreeMap<String, Value>>>(&content) {
                    Ok(parsed) => parsed.unwrap_or_default(),
                    Err(e) => {
                        error!("Failed to parse settings file {}: {}", path.display(), e);
                        BTreeMap::new()
                    }
                }
            }
            Err(_) => BTreeMap::new(),
        };

        for (key, value) in Self::defaults() {
            values.entry(key).or_insert(value);
        }

        Self {
            values,
            path: path.to_path_buf(),
        }
    }

    fn defaults() -> BTreeMap<String, Value> {
        let mut values = BTreeMap::new();
        values.insert(
            "command_limit".to_string(),
            Value::from(DEFAULT_COMMAND_LIMIT as u64),
        );
        values.insert("open_previous_files".to_string(), Value::from(true));
        values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Remove a setting. Returns false when the key was not set.
    pub fn delete(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Upper bound for the command history (`command_limit`).
    pub fn command_limit(&self) -> usize {
        self.values
            .get("command_limit")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_COMMAND_LIMIT)
    }

    /// Statement timeout for new connections, in milliseconds.
    ///
    /// The key is capitalized for compatibility with existing files.
    pub fn timeout_ms(&self) -> u64 {
        self.values
            .get("Timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Whether the editor restores previously open files.
    pub fn open_previous_files(&self) -> bool {
        self.values
            .get("open_previous_files")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    /// Name of the configured color theme, if any.
    pub fn color_theme(&self) -> Option<&str> {
        self.values.get("color_theme").and_then(Value::as_str)
    }

    /// Write all settings back, overwriting the whole file.
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = serde_yaml::to_string(&self.values).context("Failed to serialize settings")?;

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write settings file: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_seeds_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_from_path(&dir.path().join("settings.yaml"));

        assert_eq!(settings.command_limit(), 500);
        assert!(settings.open_previous_files());
        assert_eq!(settings.timeout_ms(), 10_000);
        assert!(settings.color_theme().is_none());
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "{ not yaml: [").unwrap();

        let settings = Settings::load_from_path(&path);
        assert_eq!(settings.command_limit(), 500);
    }

    #[test]
    fn test_empty_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "").unwrap();

        let settings = Settings::load_from_path(&path);
        assert!(settings.open_previous_files());
    }

    #[test]
    fn test_existing_values_win_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "command_limit: 42\nopen_previous_files: false\n").unwrap();

        let settings = Settings::load_from_path(&path);
        assert_eq!(settings.command_limit(), 42);
        assert!(!settings.open_previous_files());
    }

    #[test]
    fn test_set_get_delete() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::load_from_path(&dir.path().join("settings.yaml"));

        settings.set("color_theme", Value::from("Hack"));
        assert_eq!(settings.color_theme(), Some("Hack"));

        assert!(settings.delete("color_theme"));
        assert!(!settings.delete("color_theme"));
        assert!(settings.color_theme().is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.yaml");

        let mut settings = Settings::load_from_path(&path);
        settings.set("Timeout", Value::from(5000u64));
        settings.save().unwrap();

        let reloaded = Settings::load_from_path(&path);
        assert_eq!(reloaded.timeout_ms(), 5000);
        // Seeded defaults survive the round trip.
        assert_eq!(reloaded.command_limit(), 500);
    }
}
