//! Deterministic manifest generation.
//!
//! Walks a release tree, applies the scope exclusions described in §4.2,
//! and emits a canonical [`Manifest`] with per-file URLs and a self-hash.
//! Running the generator twice on byte-identical inputs must yield
//! byte-identical manifest bytes (§8) — the only source of nondeterminism
//! this module must guard against is directory-walk ordering, which is why
//! every path list is sorted before it touches the manifest.

use std::path::{Component, Path};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use packmule_hash::hash_file;
use packmule_manifest::{DeletePolicy, FileEntry, Manifest};

/// Directory names that are never walked into, regardless of depth:
/// virtualenv-equivalent caches, CI scratch, VCS metadata, byte-compiled
/// caches, large-artifact staging areas. Exclusion by name, not by content
/// or size (§4.2: "never exclude files whose contents influence output
/// correctness... even if large").
pub const EXCLUDED_DIR_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".venv",
    "venv",
    ".tox",
    "node_modules",
    ".staging",
    "runtime-cache",
    "user-data",
    "logs",
    ".pytest_cache",
    ".mypy_cache",
];

/// File name suffixes that are excluded wherever they appear: temporary
/// files and OS metadata, never content that affects correctness.
pub const EXCLUDED_FILE_SUFFIXES: &[&str] = &[".tmp", ".swp", ".bak", "~"];

/// Exact file names that are always excluded (OS metadata).
pub const EXCLUDED_FILE_NAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

pub struct GeneratorInput<'a> {
    pub release_root: &'a Path,
    pub tool_id: &'a str,
    pub tool_version: &'a str,
    pub base_url: &'a str,
    pub delete_policy: DeletePolicy,
    pub extra_ignore_globs: Vec<String>,
}

/// Generate a manifest for `input.release_root`. Surfaces an error naming
/// the offending path on unreadable files (§4.2 failure mode) and rejects
/// non-UTF-8 file names.
pub fn generate(input: &GeneratorInput) -> Result<Manifest> {
    let mut relative_paths = Vec::new();
    walk(input.release_root, input.release_root, &mut relative_paths)?;
    relative_paths.sort();

    let mut files = Vec::with_capacity(relative_paths.len());
    for rel in &relative_paths {
        let abs = input.release_root.join(rel.replace('/', std::path::MAIN_SEPARATOR_STR));
        let sha256 = hash_file(&abs)
            .with_context(|| format!("failed to hash release file {rel:?} at {}", abs.display()))?;
        let size = std::fs::metadata(&abs)
            .with_context(|| format!("failed to stat release file {rel:?} at {}", abs.display()))?
            .len();
        let url = format!(
            "{}/{}/{}/files/{}",
            input.base_url.trim_end_matches('/'),
            input.tool_id,
            input.tool_version,
            percent_encode_path(rel)
        );
        let executable = is_executable(&abs);

        files.push(FileEntry {
            path: rel.clone(),
            sha256,
            size,
            url,
            executable,
        });
    }

    Manifest::new(
        input.tool_id,
        input.tool_version,
        Utc::now(),
        files,
        input.delete_policy,
        input.extra_ignore_globs.clone(),
    )
    .map_err(Into::into)
}

/// Recursively collect POSIX-normalized relative paths of every included
/// file under `dir`, relative to `root`.
fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;

        let name = entry.file_name();
        let name = name
            .to_str()
            .with_context(|| format!("non-UTF-8 file name at {}", path.display()))?;

        if file_type.is_dir() {
            if EXCLUDED_DIR_NAMES.contains(&name) {
                continue;
            }
            walk(root, &path, out)?;
            continue;
        }

        if !file_type.is_file() {
            // Symlinks and other special files are not part of a release's
            // content-addressed payload.
            continue;
        }

        if EXCLUDED_FILE_NAMES.contains(&name)
            || EXCLUDED_FILE_SUFFIXES.iter().any(|suf| name.ends_with(suf))
        {
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("{} is not under {}", path.display(), root.display()))?;
        out.push(to_posix(rel)?);
    }

    Ok(())
}

fn to_posix(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .with_context(|| format!("non-UTF-8 path component in {}", rel.display()))?;
                parts.push(part.to_string());
            }
            other => bail!("unexpected path component {other:?} in release tree path {rel:?}"),
        }
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> Option<bool> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> Option<bool> {
    None
}

/// Percent-encode each path segment against the RFC 3986 `pchar` set,
/// leaving `/` as the segment separator untouched.
fn percent_encode_path(path: &str) -> String {
    path.split('/')
        .map(percent_encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn percent_encode_segment(segment: &str) -> String {
    const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.~";
    let mut out = String::with_capacity(segment.len());
    for byte in segment.as_bytes() {
        if UNRESERVED.contains(byte) {
            out.push(*byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
