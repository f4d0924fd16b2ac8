//! Configuration stores.
//!
//! Everything lives as YAML files in a per-user config directory: general
//! settings, editor color themes, saved connection parameters and the list
//! of open editor files. All loads are permissive, since the files can be
//! edited by hand; a broken file logs and falls back to defaults instead of
//! failing startup.

mod connections;
mod open_files;
mod settings;
mod themes;

pub use connections::{ConnectionStore, SavedConnection};
pub use open_files::OpenFiles;
pub use settings::Settings;
pub use themes::{ColorTheme, ThemeStore};

use std::path::PathBuf;

/// Returns the config directory path.
///
/// Checks the `PGARBOR_CONFIG_DIR` environment variable first, then falls
/// back to the system default (~/.config/pgarbor on Linux/macOS).
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("PGARBOR_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|p| p.join("pgarbor"))
}

/// Returns the settings file path (~/.config/pgarbor/settings.yaml)
pub fn settings_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.yaml"))
}

/// Returns the themes file path (~/.config/pgarbor/themes.yaml)
pub fn themes_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("themes.yaml"))
}

/// Returns the connections file path (~/.config/pgarbor/connections.yaml)
pub fn connections_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("connections.yaml"))
}

/// Returns the history file path (~/.config/pgarbor/command_history.yaml)
pub fn history_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("command_history.yaml"))
}

/// Returns the open files path (~/.config/pgarbor/open_files.yaml)
pub fn open_files_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("open_files.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths_are_consistent() {
        // These should return Some on most systems.
        if let (Some(dir), Some(settings), Some(connections), Some(history)) = (
            config_dir(),
            settings_path(),
            connections_path(),
            history_path(),
        ) {
            assert!(settings.starts_with(&dir));
            assert!(connections.starts_with(&dir));
            assert!(history.starts_with(&dir));
            assert!(settings.ends_with("settings.yaml"));
            assert!(connections.ends_with("connections.yaml"));
            assert!(history.ends_with("command_history.yaml"));
        }
    }
}
