//! Persistence for the editor's open files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::error;

/// The list of files open in editor tabs, persisted across runs.
pub struct OpenFiles {
    files: Vec<PathBuf>,
    path: PathBuf,
}

impl OpenFiles {
    /// Load the stored list from the default path.
    ///
    /// When `keep_previous` is false (the `open_previous_files` setting is
    /// off) the stored list is discarded and the file rewritten empty.
    pub fn load(keep_previous: bool) -> Self {
        match super::open_files_path() {
            Some(path) => Self::load_from_path(&path, keep_previous),
            None => Self {
                files: Vec::new(),
                path: PathBuf::new(),
            },
        }
    }

    /// Load the stored list from a specific path.
    pub fn load_from_path(path: &Path, keep_previous: bool) -> Self {
        let files = if keep_previous {
            match std::fs::read_to_string(path) {
                Ok(content) => match serde_yaml::from_str::<Option<Vec<PathBuf>>>(&content) {
                    Ok(parsed) => parsed.unwrap_or_default(),
                    Err(e) => {
                        error!("Failed to parse open files {}: {}", path.display(), e);
                        Vec::new()
                    }
                },
                Err(_) => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let store = Self {
            files,
            path: path.to_path_buf(),
        };

        if !keep_previous {
            if let Err(e) = store.save() {
                error!("Failed to clear open files: {}", e);
            }
        }

        store
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn add(&mut self, file: impl Into<PathBuf>) {
        self.files.push(file.into());
    }

    /// Remove one file. Returns false when it was not in the list.
    pub fn delete(&mut self, file: &Path) -> bool {
        match self.files.iter().position(|f| f == file) {
            Some(index) => {
                self.files.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Write the list back, overwriting the whole file.
    pub fn save(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = serde_yaml::to_string(&self.files).context("Failed to serialize open files")?;

        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write open files: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("open_files.yaml");

        {
            let mut store = OpenFiles::load_from_path(&path, true);
            store.add("/tmp/a.sql");
            store.add("/tmp/b.sql");
            assert!(store.delete(Path::new("/tmp/a.sql")));
            assert!(!store.delete(Path::new("/tmp/a.sql")));
            store.save().unwrap();
        }

        let store = OpenFiles::load_from_path(&path, true);
        assert_eq!(store.files(), [PathBuf::from("/tmp/b.sql")]);
    }

    #[test]
    fn test_disabled_restore_clears_stored_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("open_files.yaml");

        {
            let mut store = OpenFiles::load_from_path(&path, true);
            store.add("/tmp/a.sql");
            store.save().unwrap();
        }

        // open_previous_files off: the stored list is dropped on load and
        // the file rewritten empty.
        let store = OpenFiles::load_from_path(&path, false);
        assert!(store.files().is_empty());

        let reloaded = OpenFiles::load_from_path(&path, true);
        assert!(reloaded.files().is_empty());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = OpenFiles::load_from_path(&dir.path().join("open_files.yaml"), true);
        assert!(store.files().is_empty());
    }
}
