//! Editor color themes.
//!
//! Themes map a name to the six colors the SQL editor uses. An empty or
//! missing file is seeded with the three built-in themes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::error;

/// The colors of one theme, as `#aarrggbb` strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorTheme {
    pub default_color: String,
    pub default_paper_color: String,
    pub keyword_color: String,
    pub number_color: String,
    pub other_keyword_color: String,
    pub apostrophe_color: String,
}

impl ColorTheme {
    fn new(
        default_color: &str,
        default_paper_color: &str,
        keyword_color: &str,
        number_color: &str,
        other_keyword_color: &str,
        apostrophe_color: &str,
    ) -> Self {
        Self {
            default_color: default_color.to_string(),
            default_paper_color: default_paper_color.to_string(),
            keyword_color: keyword_color.to_string(),
            number_color: number_color.to_string(),
            other_keyword_color: other_keyword_color.to_string(),
            apostrophe_color: apostrophe_color.to_string(),
        }
    }
}

/// Named themes with YAML persistence.
pub struct ThemeStore {
    themes: BTreeMap<String, ColorTheme>,
    path: PathBuf,
}

impl ThemeStore {
    /// Load themes from the default path.
    pub fn load() -> Self {
        match super::themes_path() {
            Some(path) => Self::load_from_path(&path),
            None => Self {
                themes: default_themes(),
                path: PathBuf::new(),
            },
        }
    }

    /// Load themes from a specific path, seeding the built-in themes when
    /// the file is missing, empty or broken.
    pub fn load_from_path(path: &Path) -> Self {
        let themes = match std::fs::read_to_string(path) {
            Ok(content) => {
                match serde_yaml::from_str::<Option<BTreeMap<String, ColorTheme>>>(&content) {
                    Ok(Some(parsed)) if !parsed.is_empty() => parsed,
                    Ok(_) => default_themes(),
                    Err(e) => {
                        error!("Failed to parse themes file {}: {}", path.display(), e);
                        default_themes()
                    }
                }
            }
            Err(_) => default_themes(),
        };

        Self {
            themes,
            path: path.to_path_buf(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ColorTheme> {
        self.themes.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.themes.keys().map(String::as_str)
    }

    /// Add or replace a theme.
    pub fn set(&mut self, name: impl Into<String>, theme: ColorTheme) {
        self.themes.insert(name.into(), theme);
    }

    /// Remove a theme. Returns false when it did not exist.
    pub fn delete(&mut self, name: &str) -> bool {
        self.themes.remove(name).is_some()
    }

    /// The theme configured in the settings, with its name.
    pub fn configured<'a>(&'a self, settings: &'a super::Settings) -> Option<(&'a str, &'a ColorTheme)> {
        let name = settings.color_theme()?;
        self.themes.get(name).map(|theme| (name, theme))
    }

    /// Write all themes back, overwriting the whole file.
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = serde_yaml::to_string(&self.themes).context("Failed to serialize themes")?;

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write themes file: {}", self.path.display()))
    }
}

/// The three built-in themes.
fn default_themes() -> BTreeMap<String, ColorTheme> {
    let mut themes = BTreeMap::new();
    themes.insert(
        "Default".to_string(),
        ColorTheme::new(
            "ff000000",
            "#ffffffff",
            "#ff00007f",
            "#ff007f7f",
            "#ff7f7f00",
            "#ff7f007f",
        ),
    );
    themes.insert(
        "Hack".to_string(),
        ColorTheme::new(
            "#59ff47", "#141414", "#679cff", "#85fff7", "#ffe19b", "#f8bdff",
        ),
    );
    themes.insert(
        "Avocado".to_string(),
        ColorTheme::new(
            "#3a330a", "#feffb3", "#68bd22", "#42ff9a", "#00ffc8", "#fff04a",
        ),
    );
    themes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use serde_yaml::Value;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_seeds_builtin_themes() {
        let dir = tempdir().unwrap();
        let store = ThemeStore::load_from_path(&dir.path().join("themes.yaml"));

        let names: Vec<_> = store.names().collect();
        assert_eq!(names, vec!["Avocado", "Default", "Hack"]);

        let hack = store.get("Hack").unwrap();
        assert_eq!(hack.default_color, "#59ff47");
        assert_eq!(hack.default_paper_color, "#141414");
    }

    #[test]
    fn test_existing_themes_are_not_overwritten() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("themes.yaml");
        std::fs::write(
            &path,
            "Mine:\n  default_color: '#111111'\n  default_paper_color: '#222222'\n  keyword_color: '#333333'\n  number_color: '#444444'\n  other_keyword_color: '#555555'\n  apostrophe_color: '#666666'\n",
        )
        .unwrap();

        let store = ThemeStore::load_from_path(&path);
        assert!(store.get("Mine").is_some());
        assert!(store.get("Default").is_none());
    }

    #[test]
    fn test_set_delete_and_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("themes.yaml");

        {
            let mut store = ThemeStore::load_from_path(&path);
            store.set(
                "Custom",
                ColorTheme::new("#1", "#2", "#3", "#4", "#5", "#6"),
            );
            store.save().unwrap();
        }

        let mut store = ThemeStore::load_from_path(&path);
        assert!(store.get("Custom").is_some());
        assert!(store.delete("Custom"));
        assert!(!store.delete("Custom"));
    }

    #[test]
    fn test_configured_theme_lookup() {
        let dir = tempdir().unwrap();
        let store = ThemeStore::load_from_path(&dir.path().join("themes.yaml"));
        let mut settings = Settings::load_from_path(&dir.path().join("settings.yaml"));

        assert!(store.configured(&settings).is_none());

        settings.set("color_theme", Value::from("Avocado"));
        let (name, theme) = store.configured(&settings).unwrap();
        assert_eq!(name, "Avocado");
        assert_eq!(theme.default_paper_color, "#feffb3");

        settings.set("color_theme", Value::from("DoesNotExist"));
        assert!(store.configured(&settings).is_none());
    }
}
