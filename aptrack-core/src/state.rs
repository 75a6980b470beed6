//! Small JSON files kept between runs.
//!
//! - [`GameStatusStore`]: which player joined with which game file.
//! - [`UploadCatalog`]: files each user has uploaded.
//!
//! Both load as empty when the file does not exist yet and are written back
//! whole through a temporary file.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

fn load_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(T::default()),
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================
// Game status
// ============================================

/// The game file a player registered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStatus {
    pub filepath: PathBuf,
    pub game: String,
    pub joined_at: DateTime<Utc>,
}

/// Player name → game status.
#[derive(Debug, Default)]
pub struct GameStatusStore {
    path: PathBuf,
    entries: BTreeMap<String, GameStatus>,
}

impl GameStatusStore {
    pub fn load(path: &Path) -> Result<Self> {
        let entries = load_json(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn save(&self) -> Result<()> {
        save_json(&self.path, &self.entries)
    }

    /// Insert or replace; returns the previous entry.
    pub fn insert(&mut self, player: impl Into<String>, status: GameStatus) -> Option<GameStatus> {
        self.entries.insert(player.into(), status)
    }

    pub fn remove(&mut self, player: &str) -> Option<GameStatus> {
        self.entries.remove(player)
    }

    pub fn get(&self, player: &str) -> Option<&GameStatus> {
        self.entries.get(player)
    }

    /// Entries sorted by player name.
    pub fn list(&self) -> impl Iterator<Item = (&str, &GameStatus)> {
        self.entries.iter().map(|(name, status)| (name.as_str(), status))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================
// Upload catalog
// ============================================

/// One uploaded file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    /// Object storage key
    pub key: String,
    #[serde(default)]
    pub game: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// User id → uploaded files, oldest first.
#[derive(Debug, Default)]
pub struct UploadCatalog {
    path: PathBuf,
    entries: BTreeMap<String, Vec<FileDescriptor>>,
}

impl UploadCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let entries = load_json(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn save(&self) -> Result<()> {
        save_json(&self.path, &self.entries)
    }

    /// Add a file for a user as the newest, replacing one with the same key.
    pub fn insert(&mut self, user: impl Into<String>, file: FileDescriptor) {
        let files = self.entries.entry(user.into()).or_default();
        files.retain(|f| f.key != file.key);
        files.push(file);
    }

    /// Remove a file by key; drops the user when nothing is left.
    pub fn remove(&mut self, user: &str, key: &str) -> Option<FileDescriptor> {
        let files = self.entries.get_mut(user)?;
        let index = files.iter().position(|f| f.key == key)?;
        let removed = files.remove(index);
        if files.is_empty() {
            self.entries.remove(user);
        }
        Some(removed)
    }

    pub fn list(&self, user: &str) -> &[FileDescriptor] {
        self.entries.get(user).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
