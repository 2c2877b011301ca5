//! Streaming SHA-256 hashing and canonical JSON serialization.
//!
//! This crate provides the two primitives every other `packmule` crate
//! builds on: a streaming file hasher (used for manifest generation, staged
//! file verification, and artifact validation) and a canonical JSON encoder
//! (used to compute `manifest_hash` and to compare manifests across
//! machines byte-for-byte).

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Chunk size used when streaming file contents through the hasher.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Compute the lowercase hex SHA-256 of a file's contents, streaming in
/// [`CHUNK_SIZE`] chunks so files far larger than available memory can be
/// hashed without holding them whole.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {} while hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute the lowercase hex SHA-256 of an in-memory byte string.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Incremental hasher for callers streaming bytes from a source other than a
/// plain file (e.g. a download that appends to an existing partial file).
#[derive(Debug, Default)]
pub struct StreamingHasher {
    hasher: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Feed the hasher the full contents of a file (used to re-derive a
    /// streaming hash over bytes already on disk before appending more).
    pub fn update_from_file(&mut self, path: &Path) -> Result<()> {
        let mut file = File::open(path)
            .with_context(|| format!("failed to open {} for hashing", path.display()))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("failed to read {} while hashing", path.display()))?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buf[..n]);
        }
        Ok(())
    }

    pub fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Produce the canonical byte sequence for a JSON value: object keys sorted
/// lexicographically at every nesting level, UTF-8 without BOM, no
/// insignificant whitespace, arrays left in their original order.
///
/// Callers that need to exclude fields (e.g. `manifest_hash` and
/// `created_at` before hashing) should remove them from the [`Value`] before
/// calling this function.
pub fn canonical_json(value: &Value) -> String {
    let sorted = sort_value(value);
    serde_json::to_string(&sorted).expect("canonical JSON values always serialize")
}

/// Compute the SHA-256 over a value's canonical serialization.
pub fn canonical_hash(value: &Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

/// Recursively rebuild a [`Value`], sorting object keys. `serde_json::Map`
/// preserves insertion order by default; reinserting keys in sorted order is
/// the simplest way to guarantee canonical key ordering regardless of how
/// the value was originally constructed or parsed.
fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_value(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// Write `data` to `path` via a temp file in the same directory, fsync, then
/// rename — the atomic-write idiom used everywhere on-disk state must never
/// be observed half-written (lock files, pointer files, staged manifests).
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("packmule"),
        std::process::id()
    ));

    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
    }

    std::fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
