//! Save file and multidata parsing.
//!
//! Both files are zlib-compressed pickles. Multidata carries a one-byte
//! format version in front of the compressed payload; save files do not.
//! Parsing is tolerant of types the decoder cannot rebuild (see
//! [`pickle::TolerantResolver`]) and only fails on structural damage.

pub mod pickle;
pub mod snapshot;
pub mod value;

pub use pickle::{StrictResolver, TolerantResolver, TypeResolver};
pub use snapshot::{Multidata, Snapshot, CLIENT_GOAL};
pub use value::{Instance, Value};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use flate2::read::ZlibDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Extension of server save files.
pub const SAVE_EXTENSION: &str = "apsave";

/// Extension of generated multiworld data files.
pub const MULTIDATA_EXTENSION: &str = "archipelago";

/// Inflate a payload, skipping a one-byte prefix if the bare bytes fail.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    match inflate(bytes) {
        Ok(data) => Ok(data),
        Err(first) => match bytes.get(1..) {
            Some(rest) if !rest.is_empty() => inflate(rest).map_err(|_| {
                Error::CorruptSnapshot(format!("zlib decompression failed: {}", first))
            }),
            _ => Err(Error::CorruptSnapshot(format!(
                "zlib decompression failed: {}",
                first
            ))),
        },
    }
}

fn inflate(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Decompress and decode a graph with the given type strategy.
pub fn decode(bytes: &[u8], resolver: &dyn TypeResolver) -> Result<Value> {
    let raw = decompress(bytes)?;
    pickle::from_slice(&raw, resolver)
}

pub fn parse_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    let root = decode(bytes, &TolerantResolver)?;
    Ok(Snapshot::from_value(&root))
}

pub fn parse_multidata(bytes: &[u8]) -> Result<Multidata> {
    let root = decode(bytes, &TolerantResolver)?;
    Ok(Multidata::from_value(&root))
}

/// Read and parse a save file. Callers reload on every query since the
/// server rewrites the file while running.
pub fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let bytes = std::fs::read(path)?;
    parse_snapshot(&bytes).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Failed to parse save file");
        e
    })
}

pub fn load_multidata(path: &Path) -> Result<Multidata> {
    let bytes = std::fs::read(path)?;
    parse_multidata(&bytes).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "Failed to parse multidata file");
        e
    })
}

/// Most recently modified `*.{ext}` file directly under `dir`.
pub fn find_latest(dir: &Path, ext: &str) -> Option<PathBuf> {
    let pattern = dir.join(format!("*.{}", ext));
    let pattern = pattern.to_str()?;
    let entries = match glob::glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Invalid file pattern");
            return None;
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

/// Last modification time of a file.
pub fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified))
}
