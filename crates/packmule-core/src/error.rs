//! Stable error kinds (spec §7 and §4.7's failure taxonomy) attached to
//! `anyhow::Error` rather than expressed as a type hierarchy.
//!
//! The orchestration layer uses `anyhow::Result` + `.context(...)` the way
//! every other teacher module does, *except* for the closed set of stable
//! kinds a caller legitimately needs to match on (to decide "is this
//! recoverable", "should I retry", "should I quarantine-and-retry"). Those
//! kinds are a plain `Copy` enum attached to the outermost `anyhow::Error` via
//! [`WithKind::with_kind`] at the point of failure, and recovered with
//! [`error_kind`] — no downcasting through an error hierarchy required.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Manifest JSON failed to parse or violates a structural invariant.
    /// Not recoverable: abort before any disk work.
    ManifestMalformed,
    /// The target manifest's own `manifest_hash` does not match its
    /// content. Not recoverable: abort before any disk work.
    HashMismatchManifest,
    /// A file fetch failed. Recoverable across retries by the caller;
    /// staging is torn down.
    DownloadFail,
    /// A staged file's hash didn't match the manifest entry. Not
    /// recoverable: staging torn down, previous release untouched.
    VerifyFail,
    /// Promotion (rename staging → release) or the pointer flip failed.
    /// Partially recoverable: re-running the update is idempotent.
    ActivateFail,
    /// Timed out acquiring the cross-process artifact lock.
    LockTimeout,
    /// The artifact consumer detected corruption at load time. Repaired by
    /// restart via the pending-quarantine marker.
    LoadCorrupt,
    /// An operation attempted to touch a protected directory. Fatal:
    /// internal bug, refuse to continue.
    ProtectedViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ManifestMalformed => "MANIFEST_MALFORMED",
            ErrorKind::HashMismatchManifest => "HASH_MISMATCH_MANIFEST",
            ErrorKind::DownloadFail => "DOWNLOAD_FAIL",
            ErrorKind::VerifyFail => "VERIFY_FAIL",
            ErrorKind::ActivateFail => "ACTIVATE_FAIL",
            ErrorKind::LockTimeout => "LOCK_TIMEOUT",
            ErrorKind::LoadCorrupt => "LOAD_CORRUPT",
            ErrorKind::ProtectedViolation => "PROTECTED_VIOLATION",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attach a stable [`ErrorKind`] to a fallible result's error at the point
/// it's raised.
pub trait WithKind<T> {
    fn with_kind(self, kind: ErrorKind) -> anyhow::Result<T>;
}

impl<T, E> WithKind<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn with_kind(self, kind: ErrorKind) -> anyhow::Result<T> {
        self.map_err(|e| e.into().context(kind))
    }
}

/// Recover the [`ErrorKind`] attached to `err` by [`WithKind::with_kind`],
/// if any. Only finds a kind attached at the outermost `.context(kind)`
/// call, which is why `with_kind` should be applied at the point of
/// failure rather than threaded back up through later `.context(...)` calls.
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.downcast_ref::<ErrorKind>().copied()
}
