//! Manifest data model, invariants, and diff computation.
//!
//! A [`Manifest`] is the canonical catalog of one tool release: every file,
//! its hash and size, a per-file download URL, and a self-hash
//! ([`Manifest::manifest_hash`]) that identifies the release's content
//! fleet-wide. This crate owns the in-memory representation and the pure
//! diff algorithm; it does not touch the filesystem beyond `load`/`save`.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use packmule_hash::{atomic_write, canonical_hash, canonical_json};
use serde::{Deserialize, Serialize};

/// Scopes the updater must never read or write on disk: worker-owned,
/// runtime state that has no business appearing in a release manifest.
/// Every manifest's `ignore_globs` is required to carry these (§3 invariant:
/// "`ignore_globs` always includes the worker-owned scopes").
pub const REQUIRED_IGNORE_GLOBS: &[&str] = &[
    "runtime-cache/**",
    "user-data/**",
    "logs/**",
    ".venv/**",
];

pub const CURRENT_MANIFEST_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative, POSIX-normalized path (`/`-separated), unique within the
    /// manifest, never empty, never containing `..`, never absolute.
    pub path: String,
    /// Lowercase hex, 64 chars.
    pub sha256: String,
    pub size: u64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Only prune the old release directory wholesale.
    Safe,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: String,
    pub tool_id: String,
    pub tool_version: String,
    /// Informational only; excluded from `manifest_hash`.
    pub created_at: DateTime<Utc>,
    /// Sorted ascending by `path`.
    pub files: Vec<FileEntry>,
    pub delete_policy: DeletePolicy,
    #[serde(default)]
    pub ignore_globs: Vec<String>,
    pub manifest_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("path {0:?} is not a valid release-relative path")]
    InvalidPath(String),
    #[error("duplicate path {0:?} in manifest")]
    DuplicatePath(String),
    #[error("files are not sorted ascending by path (first offending path: {0:?})")]
    NotSorted(String),
    #[error("sha256 for {path:?} is not 64 lowercase hex characters: {sha256:?}")]
    InvalidSha256 { path: String, sha256: String },
    #[error("ignore_globs is missing required scope {0:?}")]
    MissingRequiredIgnoreGlob(String),
    #[error(
        "manifest_hash mismatch: manifest carries {stored}, recomputed {recomputed} from its own content"
    )]
    HashMismatch { stored: String, recomputed: String },
}

impl FileEntry {
    fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_release_path(&self.path) {
            return Err(ManifestError::InvalidPath(self.path.clone()));
        }
        let sha_ok = self.sha256.len() == 64
            && self.sha256.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if !sha_ok {
            return Err(ManifestError::InvalidSha256 {
                path: self.path.clone(),
                sha256: self.sha256.clone(),
            });
        }
        Ok(())
    }
}

/// A path is valid within a release manifest if it is relative, uses `/`
/// separators, is non-empty, and contains no `..` component.
pub fn is_valid_release_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    path.split('/').all(|seg| !seg.is_empty() && seg != "..")
        && !path.split('/').any(|seg| seg == ".")
}

impl Manifest {
    /// Build a manifest from its content fields, sort `files` by path, merge
    /// in the required protected-scope ignore globs, and compute
    /// `manifest_hash`. `files` need not be pre-sorted.
    pub fn new(
        tool_id: impl Into<String>,
        tool_version: impl Into<String>,
        created_at: DateTime<Utc>,
        mut files: Vec<FileEntry>,
        delete_policy: DeletePolicy,
        mut ignore_globs: Vec<String>,
    ) -> Result<Self, ManifestError> {
        files.sort_by(|a, b| a.path.cmp(&b.path));

        for required in REQUIRED_IGNORE_GLOBS {
            if !ignore_globs.iter().any(|g| g == required) {
                ignore_globs.push((*required).to_string());
            }
        }

        let mut manifest = Manifest {
            manifest_version: CURRENT_MANIFEST_VERSION.to_string(),
            tool_id: tool_id.into(),
            tool_version: tool_version.into(),
            created_at,
            files,
            delete_policy,
            ignore_globs,
            manifest_hash: String::new(),
        };
        manifest.validate()?;
        manifest.manifest_hash = manifest.compute_hash();
        Ok(manifest)
    }

    /// Recompute `manifest_hash` per §4.1: canonical serialization of the
    /// manifest with `manifest_hash` and `created_at` stripped, hashed with
    /// SHA-256.
    pub fn compute_hash(&self) -> String {
        let mut value = serde_json::to_value(self).expect("Manifest always serializes");
        if let Some(obj) = value.as_object_mut() {
            obj.remove("manifest_hash");
            obj.remove("created_at");
        }
        canonical_hash(&value)
    }

    /// Validate every invariant from §3 except `manifest_hash` agreement
    /// (checked separately by [`Manifest::verify_hash`], since a manifest
    /// that fails hash agreement is still structurally well-formed and
    /// callers may want to report both problems independently).
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut seen = BTreeSet::new();
        let mut last_path: Option<&str> = None;
        for entry in &self.files {
            entry.validate()?;
            if !seen.insert(entry.path.as_str()) {
                return Err(ManifestError::DuplicatePath(entry.path.clone()));
            }
            if let Some(last) = last_path
                && last > entry.path.as_str()
            {
                return Err(ManifestError::NotSorted(entry.path.clone()));
            }
            last_path = Some(entry.path.as_str());
        }

        for required in REQUIRED_IGNORE_GLOBS {
            if !self.ignore_globs.iter().any(|g| g == required) {
                return Err(ManifestError::MissingRequiredIgnoreGlob((*required).to_string()));
            }
        }

        Ok(())
    }

    /// Verify the manifest's own `manifest_hash` agrees with what its
    /// content recomputes to. A mismatch is `HASH_MISMATCH_MANIFEST` (§7):
    /// non-recoverable, the caller must abort before any disk work.
    pub fn verify_hash(&self) -> Result<(), ManifestError> {
        let recomputed = self.compute_hash();
        if recomputed != self.manifest_hash {
            return Err(ManifestError::HashMismatch {
                stored: self.manifest_hash.clone(),
                recomputed,
            });
        }
        Ok(())
    }

    /// Look up a file entry by path.
    pub fn find(&self, path: &str) -> Option<&FileEntry> {
        // files are sorted by path; binary_search is valid.
        self.files
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|idx| &self.files[idx])
    }

    /// Canonical byte form of the whole manifest (including `manifest_hash`
    /// and `created_at`), used both for `manifest.json` on disk (§4.6 step
    /// 5) and for byte-for-byte determinism checks (§8: generating a
    /// manifest twice from the same tree yields identical bytes).
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(self).context("failed to serialize manifest")?;
        Ok(canonical_json(&value).into_bytes())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("manifest at {} is malformed JSON", path.display()))?;
        manifest
            .validate()
            .with_context(|| format!("manifest at {} fails invariants", path.display()))?;
        Ok(manifest)
    }

    /// Load a manifest if present, returning `None` when the path doesn't
    /// exist (used when the "current" release may be absent).
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::load(path)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_canonical_bytes()?;
        atomic_write(path, &bytes)
    }
}

/// The classification of one target-manifest entry (or, for `Delete`, one
/// current-manifest-only entry) relative to the currently installed
/// manifest. A closed sum type per §9 ("sum types over duck-typed
/// configuration") rather than a record with optional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    /// Present in both manifests with identical hash; carry over from the
    /// current release rather than re-downloading.
    Skip(FileEntry),
    /// New in the target, or present in both with a different hash.
    Download(FileEntry),
    /// Present in `current` but absent from `target`.
    Delete { path: String },
}

impl DiffEntry {
    pub fn path(&self) -> &str {
        match self {
            DiffEntry::Skip(e) | DiffEntry::Download(e) => &e.path,
            DiffEntry::Delete { path } => path,
        }
    }
}

/// Classify every file in `target` against `current` (§4.4). Output
/// preserves target order for `Skip`/`Download` entries, followed by
/// `Delete` entries for paths present only in `current`.
pub fn diff(current: Option<&Manifest>, target: &Manifest) -> Vec<DiffEntry> {
    let mut out = Vec::with_capacity(target.files.len());

    for entry in &target.files {
        match current.and_then(|c| c.find(&entry.path)) {
            Some(existing) if existing.sha256 == entry.sha256 => {
                out.push(DiffEntry::Skip(entry.clone()));
            }
            _ => out.push(DiffEntry::Download(entry.clone())),
        }
    }

    if let Some(current) = current {
        for entry in &current.files {
            if target.find(&entry.path).is_none() {
                out.push(DiffEntry::Delete {
                    path: entry.path.clone(),
                });
            }
        }
    }

    out
}
