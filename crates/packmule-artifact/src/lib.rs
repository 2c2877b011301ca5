//! Large single-file artifact lifecycle.
//!
//! A critical single-file artifact (model weights, a large index) needs a
//! stricter acquisition path than the per-file [`packmule_download`]
//! capability: a corrupt copy can only sometimes be detected by hashing the
//! stream, since the consumer that actually loads the file may find
//! corruption the downloader's checksum couldn't have caught (e.g. a format
//! whose trailing section was truncated by a proxy that still served a
//! 200). This crate implements the lock, atomic download, validation, and
//! quarantine state machine in spec §4.7.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use packmule_download::{Downloader, FetchRequest};
use packmule_retry::{LOCK_BACKOFF_CEILING, RetryPolicy, calculate_delay};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy for the artifact lifecycle (spec §4.7).
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("timed out acquiring lock on {path}")]
    LockTimeout { path: PathBuf },
    #[error("download failed for {url}: {source}")]
    DownloadFail {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("size mismatch for {path}: expected {expected}, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("bad header for {path}: expected magic {expected:?}")]
    BadHeader { path: PathBuf, expected: Vec<u8> },
    #[error("failed to quarantine {path}: {reason}")]
    QuarantineFail { path: PathBuf, reason: String },
    #[error("artifact at {path} is corrupt: {reason}")]
    LoadCorrupt { path: PathBuf, reason: String },
}

/// Declarative description of one artifact's validation rules.
pub struct ArtifactSpec {
    pub path: PathBuf,
    pub url: String,
    pub expected_sha256: Option<String>,
    /// Minimum viable size in bytes (format-specific; e.g. 10 MiB for large
    /// model files).
    pub min_size: u64,
    /// Expected magic bytes at offset 0, if the format defines one (e.g.
    /// `b"GGUF"`).
    pub magic: Option<Vec<u8>>,
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Missing,
    Valid,
    Invalid,
    Quarantined,
    PendingQuarantine,
}

fn lock_path(artifact_path: &Path) -> PathBuf {
    with_suffix(artifact_path, ".lock")
}

fn part_path(artifact_path: &Path) -> PathBuf {
    with_suffix(artifact_path, ".part")
}

fn quarantine_marker_path(artifact_path: &Path) -> PathBuf {
    with_suffix(artifact_path, ".quarantine_pending")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Information persisted alongside the OS-level lock for human inspection
/// of a stuck lock, mirroring the teacher's `LockInfo` sidecar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// A held advisory lock on an artifact path. Mutual exclusion is enforced
/// by `fs2::FileExt::try_lock_exclusive`; the lock file is never deleted
/// while held, and releases automatically on drop.
pub struct ArtifactLock {
    file: File,
    path: PathBuf,
}

impl ArtifactLock {
    /// Poll for the lock with exponential backoff (capped at
    /// [`LOCK_BACKOFF_CEILING`]) until `timeout` elapses.
    pub fn acquire(artifact_path: &Path, timeout: Duration) -> Result<Self, ArtifactError> {
        let path = lock_path(artifact_path);
        let deadline = Instant::now() + timeout;
        let policy = RetryPolicy::Aggressive.to_config();
        let mut attempt = 0u32;

        loop {
            match Self::try_acquire_once(&path) {
                Ok(lock) => return Ok(lock),
                Err(_) if Instant::now() >= deadline => {
                    return Err(ArtifactError::LockTimeout { path });
                }
                Err(_) => {
                    attempt += 1;
                    let delay = calculate_delay(&policy, attempt).min(LOCK_BACKOFF_CEILING);
                    std::thread::sleep(delay);
                }
            }
        }
    }

    fn try_acquire_once(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        file.try_lock_exclusive()?;

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&info)?;
        let mut file = file;
        file.set_len(0)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn read_info(&self) -> anyhow::Result<LockInfo> {
        let mut content = String::new();
        let mut handle = File::open(&self.path)?;
        handle.read_to_string(&mut content)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Validate an on-disk artifact against its spec: existence, minimum size,
/// magic-byte signature, and read access.
pub fn validate(spec: &ArtifactSpec) -> Result<ArtifactState, ArtifactError> {
    if !spec.path.exists() {
        return Ok(ArtifactState::Missing);
    }

    let metadata = match std::fs::metadata(&spec.path) {
        Ok(m) => m,
        Err(_) => return Ok(ArtifactState::Invalid),
    };

    if metadata.len() < spec.min_size {
        return Ok(ArtifactState::Invalid);
    }

    let mut file = match File::open(&spec.path) {
        Ok(f) => f,
        Err(_) => return Ok(ArtifactState::Invalid),
    };

    if let Some(magic) = &spec.magic {
        let mut buf = vec![0u8; magic.len()];
        if file.read_exact(&mut buf).is_err() || &buf != magic {
            return Ok(ArtifactState::Invalid);
        }
    }

    Ok(ArtifactState::Valid)
}

/// Atomically acquire a valid copy of the artifact described by `spec`,
/// downloading (or re-downloading, after quarantining an invalid copy) as
/// needed. Consumes any pending quarantine marker from a previous run
/// before attempting anything else.
pub fn ensure_valid(
    spec: &ArtifactSpec,
    downloader: &dyn Downloader,
) -> Result<ArtifactState, ArtifactError> {
    consume_pending_quarantine(&spec.path)?;

    let _lock = ArtifactLock::acquire(&spec.path, spec.lock_timeout)?;

    match validate(spec)? {
        ArtifactState::Valid => Ok(ArtifactState::Valid),
        _ => {
            if spec.path.exists() {
                quarantine(&spec.path)?;
            }
            download_and_validate(spec, downloader)
        }
    }
}

fn download_and_validate(
    spec: &ArtifactSpec,
    downloader: &dyn Downloader,
) -> Result<ArtifactState, ArtifactError> {
    let part = part_path(&spec.path);

    let outcome = downloader
        .fetch(&FetchRequest {
            url: &spec.url,
            target_path: &part,
            expected_sha256: spec.expected_sha256.as_deref(),
            resume: false,
            progress: None,
        })
        .map_err(|source| {
            let _ = std::fs::remove_file(&part);
            ArtifactError::DownloadFail {
                url: spec.url.clone(),
                source,
            }
        })?;

    if let Some(expected_len) = outcome.content_length
        && outcome.bytes_written != expected_len
    {
        let _ = std::fs::remove_file(&part);
        return Err(ArtifactError::SizeMismatch {
            path: spec.path.clone(),
            expected: expected_len,
            actual: outcome.bytes_written,
        });
    }

    std::fs::rename(&part, &spec.path).map_err(|e| {
        let _ = std::fs::remove_file(&part);
        ArtifactError::DownloadFail {
            url: spec.url.clone(),
            source: anyhow::anyhow!("failed to rename {} into place: {e}", part.display()),
        }
    })?;

    match validate(spec)? {
        ArtifactState::Valid => Ok(ArtifactState::Valid),
        _ => Err(ArtifactError::BadHeader {
            path: spec.path.clone(),
            expected: spec.magic.clone().unwrap_or_default(),
        }),
    }
}

/// Rename `path` to `path.bad.<epoch_seconds>`. Falls back to deletion if
/// the rename is denied (Windows file-in-use semantics); surfaces
/// [`ArtifactError::QuarantineFail`] if both fail.
pub fn quarantine(path: &Path) -> Result<(), ArtifactError> {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let quarantined = with_suffix(path, &format!(".bad.{epoch}"));

    if std::fs::rename(path, &quarantined).is_ok() {
        return Ok(());
    }

    std::fs::remove_file(path).map_err(|e| ArtifactError::QuarantineFail {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Write a marker recording that the consumer detected corruption at load
/// time. Called immediately before the process exits with a distinguished
/// code; consumed on the next cold start by [`consume_pending_quarantine`]
/// before any attempt to load the artifact.
pub fn mark_pending_quarantine(path: &Path, reason: &str) -> anyhow::Result<()> {
    let marker = quarantine_marker_path(path);
    let payload = serde_json::json!({
        "reason": reason,
        "marked_at": Utc::now(),
    });
    packmule_hash::atomic_write(&marker, serde_json::to_string_pretty(&payload)?.as_bytes())
}

/// If a pending-quarantine marker exists for `path`, quarantine the
/// artifact and remove the marker. Idempotent and safe to call even when
/// no marker is present.
pub fn consume_pending_quarantine(path: &Path) -> Result<(), ArtifactError> {
    let marker = quarantine_marker_path(path);
    if !marker.exists() {
        return Ok(());
    }
    if path.exists() {
        quarantine(path)?;
    }
    let _ = std::fs::remove_file(&marker);
    Ok(())
}

pub fn pending_quarantine(path: &Path) -> bool {
    quarantine_marker_path(path).exists()
}
