//! Command history with YAML persistence and fuzzy search.
//!
//! The file is a bare list of entries, oldest first, capped at the
//! configured command limit. The cap applies both when pushing and when
//! loading against a lowered limit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nucleo_matcher::{
    pattern::{CaseMatching, Normalization, Pattern},
    Config, Matcher, Utf32Str,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::history_path;

/// A single executed command with its metadata.
///
/// The capitalized YAML keys keep existing history files readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The SQL text.
    #[serde(rename = "Command")]
    pub command: String,
    /// When the command was executed.
    #[serde(rename = "Time")]
    pub timestamp: DateTime<Utc>,
    /// Identifier of the connection it ran on, `user@host:port/database`.
    #[serde(rename = "Identifier")]
    pub connection: String,
}

impl HistoryEntry {
    pub fn new(command: String, connection: String) -> Self {
        Self {
            command,
            timestamp: Utc::now(),
            connection,
        }
    }
}

/// A match result from fuzzy search.
#[derive(Debug, Clone)]
pub struct HistoryMatch {
    /// Index into the history entries.
    pub index: usize,
    /// The matching entry.
    pub entry: HistoryEntry,
    /// Match score (higher is better).
    pub score: u32,
    /// Character indices that matched (for highlighting).
    pub indices: Vec<u32>,
}

/// Executed commands with persistence and fuzzy search.
pub struct CommandHistory {
    entries: Vec<HistoryEntry>,
    max_entries: usize,
    path: PathBuf,
    dirty: bool,
}

impl CommandHistory {
    /// Load history from the default path.
    pub fn load(max_entries: usize) -> Result<Self> {
        let path = history_path().context("Could not determine history path")?;
        Self::load_from_path(&path, max_entries)
    }

    /// Load history from a specific path.
    pub fn load_from_path(path: &Path, max_entries: usize) -> Result<Self> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read history file: {}", path.display()))?;

            // An empty file parses as no document at all.
            serde_yaml::from_str::<Option<Vec<HistoryEntry>>>(&content)
                .with_context(|| format!("Failed to parse history file: {}", path.display()))?
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        // A lowered limit drops the oldest entries.
        let dirty = entries.len() > max_entries;
        let entries = if dirty {
            let skip_count = entries.len() - max_entries;
            entries.into_iter().skip(skip_count).collect()
        } else {
            entries
        };

        Ok(Self {
            entries,
            max_entries,
            path: path.to_path_buf(),
            dirty,
        })
    }

    /// Create a new empty history (for testing or when no path is available).
    pub fn new_empty(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            path: PathBuf::new(),
            dirty: false,
        }
    }

    /// Save history to disk via a temp file in the same directory.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty || self.path.as_os_str().is_empty() {
            return Ok(());
        }

        let parent = self
            .path
            .parent()
            .context("History path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

        let content = serde_yaml::to_string(&self.entries).context("Failed to serialize history")?;

        let mut tmp = NamedTempFile::new_in(parent).context("Failed to create temp file")?;
        tmp.write_all(content.as_bytes())
            .context("Failed to write history")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to persist history file: {}", self.path.display()))?;

        self.dirty = false;
        Ok(())
    }

    /// Add a command to the history.
    pub fn push(&mut self, command: String, connection: String) {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return;
        }

        self.entries
            .push(HistoryEntry::new(trimmed.to_string(), connection));

        // Enforce the limit, oldest out first.
        while self.entries.len() > self.max_entries {
            self.entries.remove(0);
        }

        self.dirty = true;
    }

    /// Remove a single entry by index. Returns false when out of range.
    pub fn delete(&mut self, index: usize) -> bool {
        if index >= self.entries.len() {
            return false;
        }
        self.entries.remove(index);
        self.dirty = true;
        true
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Search the history with fuzzy matching.
    ///
    /// Returns matches sorted by score (best first), with character indices
    /// for highlighting. An empty pattern returns everything, most recent
    /// first.
    pub fn search(&self, pattern: &str) -> Vec<HistoryMatch> {
        if pattern.is_empty() {
            return self
                .entries
                .iter()
                .enumerate()
                .rev()
                .map(|(index, entry)| HistoryMatch {
                    index,
                    entry: entry.clone(),
                    score: 0,
                    indices: Vec::new(),
                })
                .collect();
        }

        let mut matcher = Matcher::new(Config::DEFAULT);
        let pat = Pattern::parse(pattern, CaseMatching::Ignore, Normalization::Smart);

        let mut matches: Vec<HistoryMatch> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let mut indices = Vec::new();
                let mut buf = Vec::new();
                let haystack = Utf32Str::new(&entry.command, &mut buf);

                pat.indices(haystack, &mut matcher, &mut indices)
                    .map(|score| HistoryMatch {
                        index,
                        entry: entry.clone(),
                        score,
                        indices,
                    })
            })
            .collect();

        matches.sort_by(|a, b| b.score.cmp(&a.score));

        matches
    }
}

impl Drop for CommandHistory {
    fn drop(&mut self) {
        // Try to save on drop, but don't panic on failure.
        let _ = self.save();
    }
}
