//! Object storage for configuration files.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Free-form object metadata.
pub type Metadata = BTreeMap<String, String>;

/// One stored object as returned by [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Key/value blob store.
pub trait ObjectStore {
    /// Upload the file at `path` under `key`.
    fn put(&self, path: &Path, key: &str, metadata: &Metadata) -> Result<()>;

    /// Download `key` into `path`.
    fn get(&self, key: &str, path: &Path) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Objects whose key starts with `prefix`, sorted by key.
    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;
}

/// Directory-backed store: `<hex key>.data` plus a `<hex key>.meta.json`
/// sidecar holding the key and metadata.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.data", hex::encode(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", hex::encode(key)))
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Storage("object key is empty".to_string()));
    }
    Ok(())
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, path: &Path, key: &str, metadata: &Metadata) -> Result<()> {
        check_key(key)?;
        fs::copy(path, self.data_path(key)).map_err(|e| {
            Error::Storage(format!("failed to store {} as {}: {}", path.display(), key, e))
        })?;
        let entry = ObjectEntry {
            key: key.to_string(),
            metadata: metadata.clone(),
        };
        fs::write(self.meta_path(key), serde_json::to_vec_pretty(&entry)?)?;
        tracing::debug!(key, "Object stored");
        Ok(())
    }

    fn get(&self, key: &str, path: &Path) -> Result<()> {
        check_key(key)?;
        match fs::copy(self.data_path(key), path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::Storage(format!("no object {}", key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let mut found = false;
        for path in [self.data_path(key), self.meta_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => found = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !found {
            return Err(Error::Storage(format!("no object {}", key)));
        }
        tracing::debug!(key, "Object deleted");
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            let entry: ObjectEntry = match fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable metadata");
                    continue;
                }
            };
            if entry.key.starts_with(prefix) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}
