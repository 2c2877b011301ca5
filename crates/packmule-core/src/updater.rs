//! The delta updater: orchestrates diff → stage → download → carry-over →
//! verify → activate → reclaim (spec §4.6), with crash-safe rollback and a
//! statistics surface persisted as a receipt.

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use packmule_download::{Downloader, FetchRequest};
use packmule_hash::hash_file;
use packmule_manifest::{DiffEntry, FileEntry, Manifest};
use packmule_store::{MANIFEST_FILE, ReleaseStore};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, WithKind};
use crate::events::{EventLog, UpdateEvent, UpdateEventType};
use crate::reporter::Reporter;

/// Statistics surface named by spec §4.6. Pure report: never affects
/// control flow, persisted as a receipt the way the teacher persists
/// `Receipt`/`PackageReceipt` evidence objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStats {
    pub files_downloaded: u64,
    pub files_verified: u64,
    pub files_skipped: u64,
    pub files_deleted: u64,
    pub bytes_downloaded: u64,
    /// Bounded list of secondary errors observed during the same phase
    /// (e.g. multiple file verification failures). The propagation policy
    /// (spec §7) is to surface the first blocking error but still report
    /// every secondary failure seen.
    pub errors: Vec<String>,
}

pub struct UpdateOptions {
    /// Bounded fan-out for concurrent downloads within this run (spec §5:
    /// small default, e.g. 4). Ordering across files is irrelevant: the
    /// staging directory has no observable state until promotion.
    pub fan_out: usize,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self { fan_out: 4 }
    }
}

const MAX_REPORTED_ERRORS: usize = 32;

/// Run the full activation protocol from spec §4.6, updating `store` to
/// `target`. `current` must be the manifest already loaded from
/// `store.current_manifest()` by the caller (kept as an explicit parameter
/// so callers can log/branch on it before committing to an update).
pub fn run_update(
    store: &ReleaseStore,
    current: Option<&Manifest>,
    target: &Manifest,
    downloader: &dyn Downloader,
    opts: &UpdateOptions,
    events: &mut EventLog,
    reporter: &mut dyn Reporter,
) -> Result<UpdateStats> {
    // Precondition: target manifest's own hash must agree with its content
    // before any disk work happens.
    target
        .verify_hash()
        .with_kind(ErrorKind::HashMismatchManifest)
        .with_context(|| {
            format!(
                "target manifest for {} v{} fails self-hash verification",
                target.tool_id, target.tool_version
            )
        })?;

    let tool_id = target.tool_id.clone();
    let from_version = current.map(|m| m.tool_version.clone());
    events.record(UpdateEvent {
        timestamp: Utc::now(),
        tool_id: tool_id.clone(),
        event_type: UpdateEventType::UpdateStarted {
            from_version: from_version.clone(),
            target_version: target.tool_version.clone(),
        },
    });
    reporter.info(&format!(
        "updating {} {} -> {}",
        tool_id,
        from_version.as_deref().unwrap_or("(absent)"),
        target.tool_version
    ));

    // Step 1: prepare staging.
    let staging_dir = store
        .prepare_staging(&target.tool_version)
        .with_kind(ErrorKind::ActivateFail)
        .context("failed to prepare staging directory")?;

    let mut stats = UpdateStats::default();
    let entries = packmule_manifest::diff(current, target);

    let downloads: Vec<FileEntry> = entries
        .iter()
        .filter_map(|e| match e {
            DiffEntry::Download(f) => Some(f.clone()),
            _ => None,
        })
        .collect();
    let skips: Vec<FileEntry> = entries
        .iter()
        .filter_map(|e| match e {
            DiffEntry::Skip(f) => Some(f.clone()),
            _ => None,
        })
        .collect();
    let delete_count = entries
        .iter()
        .filter(|e| matches!(e, DiffEntry::Delete { .. }))
        .count();

    // Step 2: fetch changed files, bounded fan-out.
    reporter.info(&format!("downloading {} changed files", downloads.len()));
    let (downloaded, download_errors) = fetch_all(&staging_dir, &downloads, downloader, opts.fan_out);
    stats.files_downloaded = downloaded.len() as u64;
    stats.bytes_downloaded = downloaded.iter().map(|(_, bytes)| bytes).sum();

    if !download_errors.is_empty() {
        for err in &download_errors {
            reporter.error(err);
        }
        stats.errors = truncate_errors(download_errors);
        store
            .discard_staging(&target.tool_version)
            .with_kind(ErrorKind::DownloadFail)
            .context("failed to discard staging after download failure")?;
        return Err(anyhow::anyhow!(
            "{} of {} file downloads failed",
            stats.errors.len(),
            downloads.len()
        ))
        .with_kind(ErrorKind::DownloadFail);
    }
    for (entry, bytes) in &downloaded {
        events.record(UpdateEvent {
            timestamp: Utc::now(),
            tool_id: tool_id.clone(),
            event_type: UpdateEventType::FileDownloaded {
                path: entry.path.clone(),
                bytes: *bytes,
            },
        });
    }

    // Step 3: carry over unchanged files from the current release.
    reporter.info(&format!("carrying over {} unchanged files", skips.len()));
    if let Err(err) = carry_over(store, current, &staging_dir, &skips) {
        store
            .discard_staging(&target.tool_version)
            .with_kind(ErrorKind::ActivateFail)?;
        return Err(err).with_kind(ErrorKind::ActivateFail);
    }
    stats.files_skipped = skips.len() as u64;
    for entry in &skips {
        events.record(UpdateEvent {
            timestamp: Utc::now(),
            tool_id: tool_id.clone(),
            event_type: UpdateEventType::FileSkipped {
                path: entry.path.clone(),
            },
        });
    }

    // Step 4: verify every entry in the target manifest against the staged
    // bytes. Any mismatch aborts the update; staging is torn down.
    reporter.info("verifying staged files");
    let verify_errors = verify_staged(&staging_dir, target);
    if !verify_errors.is_empty() {
        for err in &verify_errors {
            reporter.error(err);
        }
        stats.errors = truncate_errors(verify_errors);
        store
            .discard_staging(&target.tool_version)
            .with_kind(ErrorKind::VerifyFail)
            .context("failed to discard staging after verify failure")?;
        events.record(UpdateEvent {
            timestamp: Utc::now(),
            tool_id: tool_id.clone(),
            event_type: UpdateEventType::UpdateFailed {
                kind: ErrorKind::VerifyFail,
                message: stats.errors.join("; "),
            },
        });
        return Err(anyhow::anyhow!(
            "{} files failed verification",
            stats.errors.len()
        ))
        .with_kind(ErrorKind::VerifyFail);
    }
    stats.files_verified = target.files.len() as u64;
    for entry in &target.files {
        events.record(UpdateEvent {
            timestamp: Utc::now(),
            tool_id: tool_id.clone(),
            event_type: UpdateEventType::FileVerified {
                path: entry.path.clone(),
            },
        });
    }

    // Step 5: write the staged manifest.
    target
        .save(&staging_dir.join(MANIFEST_FILE))
        .with_kind(ErrorKind::ActivateFail)
        .context("failed to write staged manifest")?;

    // Step 6: promote — the commit point.
    store
        .promote(&target.tool_version)
        .with_kind(ErrorKind::ActivateFail)
        .context("failed to promote staged release")?;
    events.record(UpdateEvent {
        timestamp: Utc::now(),
        tool_id: tool_id.clone(),
        event_type: UpdateEventType::StagingPromoted {
            version: target.tool_version.clone(),
        },
    });
    reporter.info(&format!("promoted v{}", target.tool_version));

    // Step 7: flip the pointer.
    store
        .flip_pointer(&target.tool_version)
        .with_kind(ErrorKind::ActivateFail)
        .context("failed to flip current pointer")?;
    events.record(UpdateEvent {
        timestamp: Utc::now(),
        tool_id: tool_id.clone(),
        event_type: UpdateEventType::PointerFlipped {
            version: target.tool_version.clone(),
        },
    });
    reporter.info(&format!("current -> v{}", target.tool_version));

    // Step 8: reclaim the previous release and any empty staging directory.
    // This step is mere reclamation; failure here does not unwind the
    // already-committed update and can be retried on the next invocation.
    // A same-version re-run (already-installed target) has just promoted
    // staging onto releases/v<target>/ — `from_version` names that same
    // release, not a predecessor, so reclaiming it would delete the release
    // `current` now points at.
    let reclaim_target = from_version
        .as_deref()
        .filter(|previous| *previous != target.tool_version);
    if let Err(err) = store.reclaim(reclaim_target) {
        reporter.warn(&format!("reclaim failed (safe to retry later): {err:#}"));
    } else if let Some(previous) = reclaim_target {
        stats.files_deleted = delete_count as u64;
        events.record(UpdateEvent {
            timestamp: Utc::now(),
            tool_id: tool_id.clone(),
            event_type: UpdateEventType::ReleaseReclaimed {
                version: previous.to_string(),
            },
        });
    }

    Ok(stats)
}

fn truncate_errors(mut errors: Vec<String>) -> Vec<String> {
    if errors.len() > MAX_REPORTED_ERRORS {
        let omitted = errors.len() - MAX_REPORTED_ERRORS;
        errors.truncate(MAX_REPORTED_ERRORS);
        errors.push(format!("... {omitted} more errors omitted"));
    }
    errors
}

/// Fetch every `download` entry into the staging directory, bounded by
/// `fan_out` concurrent workers pulling from a shared queue. Returns the
/// entries that succeeded (with bytes written) and any per-file errors;
/// ordering across files is irrelevant (spec §5), so results need not
/// preserve input order.
fn fetch_all(
    staging_dir: &std::path::Path,
    downloads: &[FileEntry],
    downloader: &dyn Downloader,
    fan_out: usize,
) -> (Vec<(FileEntry, u64)>, Vec<String>) {
    let queue: Mutex<VecDeque<FileEntry>> = Mutex::new(downloads.iter().cloned().collect());
    let succeeded: Mutex<Vec<(FileEntry, u64)>> = Mutex::new(Vec::new());
    let errors: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let workers = fan_out.max(1).min(downloads.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let entry = {
                        let mut q = queue.lock().expect("download queue mutex poisoned");
                        q.pop_front()
                    };
                    let Some(entry) = entry else { break };

                    let target_path = staging_dir.join(entry.path.replace('/', std::path::MAIN_SEPARATOR_STR));
                    let result = downloader.fetch(&FetchRequest {
                        url: &entry.url,
                        target_path: &target_path,
                        expected_sha256: Some(&entry.sha256),
                        resume: true,
                        progress: None,
                    });

                    match result {
                        Ok(outcome) => {
                            succeeded
                                .lock()
                                .expect("succeeded mutex poisoned")
                                .push((entry, outcome.bytes_written));
                        }
                        Err(err) => {
                            errors
                                .lock()
                                .expect("errors mutex poisoned")
                                .push(format!("{}: {err:#}", entry.path));
                        }
                    }
                }
            });
        }
    });

    (
        succeeded.into_inner().expect("succeeded mutex poisoned"),
        errors.into_inner().expect("errors mutex poisoned"),
    )
}

/// Copy every `skip` entry from the current release into staging,
/// preserving directory structure and, where the platform permits,
/// metadata (mode bits on Unix).
fn carry_over(
    store: &ReleaseStore,
    current: Option<&Manifest>,
    staging_dir: &std::path::Path,
    skips: &[FileEntry],
) -> Result<()> {
    if skips.is_empty() {
        return Ok(());
    }
    let current = current.context("skip entries present but no current release to carry over from")?;
    let current_version = &current.tool_version;
    let current_dir = store.release_dir(current_version);

    for entry in skips {
        let rel = entry.path.replace('/', std::path::MAIN_SEPARATOR_STR);
        let src = current_dir.join(&rel);
        let dest = staging_dir.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        std::fs::copy(&src, &dest)
            .with_context(|| format!("failed to carry over {} from {}", entry.path, src.display()))?;
        preserve_mode(&src, &dest)?;
    }
    Ok(())
}

#[cfg(unix)]
fn preserve_mode(src: &std::path::Path, dest: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?
        .permissions();
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(perms.mode()))
        .with_context(|| format!("failed to set permissions on {}", dest.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn preserve_mode(_src: &std::path::Path, _dest: &std::path::Path) -> Result<()> {
    Ok(())
}

/// Stream-hash every file the target manifest names under `staging_dir` and
/// compare against the manifest entry. Returns a human-readable message per
/// mismatch or missing file; an empty vec means every file verified.
fn verify_staged(staging_dir: &std::path::Path, target: &Manifest) -> Vec<String> {
    let mut errors = Vec::new();
    for entry in &target.files {
        let rel = entry.path.replace('/', std::path::MAIN_SEPARATOR_STR);
        let path = staging_dir.join(&rel);
        match hash_file(&path) {
            Ok(actual) if actual == entry.sha256 => {}
            Ok(actual) => errors.push(format!(
                "{}: expected sha256 {}, got {actual}",
                entry.path, entry.sha256
            )),
            Err(err) => errors.push(format!("{}: {err:#}", entry.path)),
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use packmule_download::MockDownloader;
    use packmule_manifest::DeletePolicy;
    use tempfile::tempdir;

    fn manifest(version: &str, files: Vec<FileEntry>) -> Manifest {
        Manifest::new("demo", version, Utc::now(), files, DeletePolicy::Safe, vec![]).unwrap()
    }

    fn fixture(fixtures: &std::path::Path, name: &str, content: &[u8]) -> FileEntry {
        std::fs::write(fixtures.join(name), content).unwrap();
        FileEntry {
            path: name.to_string(),
            sha256: packmule_hash::hash_bytes(content),
            size: content.len() as u64,
            url: format!("https://updates.example.test/files/{name}"),
            executable: None,
        }
    }

    #[test]
    fn no_op_update_skips_everything_and_downloads_nothing() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path().join("store"));
        let fixtures = tempdir().unwrap();

        let a = fixture(fixtures.path(), "a.txt", b"alpha");
        let b = fixture(fixtures.path(), "b.txt", b"beta");
        let target = manifest("1.0.0", vec![a.clone(), b.clone()]);
        let downloader = MockDownloader::new(fixtures.path());
        let mut events = EventLog::new();
        let mut reporter = crate::reporter::NullReporter;

        let stats = run_update(
            &store,
            None,
            &target,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        )
        .unwrap();

        assert_eq!(stats.files_downloaded, 2);
        assert_eq!(stats.files_skipped, 0);
        assert_eq!(store.current_version().unwrap(), Some("1.0.0".to_string()));

        // Running again against the same target is a no-op: everything
        // carries over from the now-current release.
        let stats2 = run_update(
            &store,
            Some(&target),
            &target,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        )
        .unwrap();
        assert_eq!(stats2.files_downloaded, 0);
        assert_eq!(stats2.files_skipped, 2);

        // The same-version re-run must not reclaim the release it just
        // re-promoted itself onto: the active release directory and its
        // carried-over files must still be present and readable.
        assert_eq!(store.current_version().unwrap(), Some("1.0.0".to_string()));
        assert!(store.release_dir("1.0.0").join("a.txt").exists());
        assert!(store.release_dir("1.0.0").join("b.txt").exists());
        assert!(store.current_manifest().unwrap().is_some());
    }

    #[test]
    fn single_file_changed_downloads_one_and_carries_over_the_rest() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path().join("store"));
        let fixtures = tempdir().unwrap();
        let mut reporter = crate::reporter::NullReporter;
        let mut events = EventLog::new();

        let a_v1 = fixture(fixtures.path(), "a-v1.bin", b"alpha-v1");
        let b = fixture(fixtures.path(), "b.bin", b"beta");
        let installed = manifest(
            "1.0.0",
            vec![
                FileEntry {
                    path: "a.bin".to_string(),
                    ..a_v1.clone()
                },
                FileEntry {
                    path: "b.bin".to_string(),
                    ..b.clone()
                },
            ],
        );
        let downloader = MockDownloader::new(fixtures.path());
        run_update(
            &store,
            None,
            &installed,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        )
        .unwrap();

        let a_v2 = fixture(fixtures.path(), "a-v2.bin", b"alpha-v2");
        let target = manifest(
            "1.1.0",
            vec![
                FileEntry {
                    path: "a.bin".to_string(),
                    ..a_v2
                },
                FileEntry {
                    path: "b.bin".to_string(),
                    ..b
                },
            ],
        );

        let current = store.current_manifest().unwrap();
        let stats = run_update(
            &store,
            current.as_ref(),
            &target,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        )
        .unwrap();

        assert_eq!(stats.files_downloaded, 1);
        assert_eq!(stats.files_skipped, 1);
        assert_eq!(store.current_version().unwrap(), Some("1.1.0".to_string()));
        let content = std::fs::read_to_string(store.release_dir("1.1.0").join("a.bin")).unwrap();
        assert_eq!(content, "alpha-v2");
    }

    #[test]
    fn removed_file_disappears_after_update() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path().join("store"));
        let fixtures = tempdir().unwrap();
        let mut reporter = crate::reporter::NullReporter;
        let mut events = EventLog::new();
        let downloader = MockDownloader::new(fixtures.path());

        let a = fixture(fixtures.path(), "a.bin", b"alpha");
        let b = fixture(fixtures.path(), "b.bin", b"beta");
        let installed = manifest("1.0.0", vec![a.clone(), b]);
        run_update(
            &store,
            None,
            &installed,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        )
        .unwrap();

        let target = manifest("2.0.0", vec![a]);
        let current = store.current_manifest().unwrap();
        let stats = run_update(
            &store,
            current.as_ref(),
            &target,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        )
        .unwrap();

        assert_eq!(stats.files_downloaded, 0);
        assert_eq!(stats.files_skipped, 1);
        assert!(stats.files_deleted >= 1);
        assert!(!store.release_dir("2.0.0").join("b.bin").exists());
        assert!(!store.release_dir("1.0.0").exists());
    }

    #[test]
    fn hash_mismatch_aborts_before_disk_work() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path().join("store"));
        let mut reporter = crate::reporter::NullReporter;
        let mut events = EventLog::new();
        let fixtures = tempdir().unwrap();
        let downloader = MockDownloader::new(fixtures.path());

        let mut target = manifest("1.0.0", vec![]);
        target.manifest_hash = "0".repeat(64);

        let result = run_update(
            &store,
            None,
            &target,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        );

        assert!(result.is_err());
        assert_eq!(store.current_version().unwrap(), None);
        assert!(!store.staging_dir().exists() || std::fs::read_dir(store.staging_dir()).unwrap().next().is_none());
    }

    #[test]
    fn download_hash_mismatch_tears_down_staging_before_anything_promotes() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path().join("store"));
        let mut reporter = crate::reporter::NullReporter;
        let mut events = EventLog::new();
        let fixtures = tempdir().unwrap();

        // Fixture served for "a.bin" does not match the manifest's hash.
        std::fs::write(fixtures.path().join("a.bin"), b"not-matching-content").unwrap();
        let downloader = MockDownloader::new(fixtures.path());

        let target = manifest(
            "1.0.0",
            vec![FileEntry {
                path: "a.bin".to_string(),
                sha256: packmule_hash::hash_bytes(b"expected-content"),
                size: 16,
                url: "https://updates.example.test/files/a.bin".to_string(),
                executable: None,
            }],
        );

        let result = run_update(
            &store,
            None,
            &target,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        );

        assert!(result.is_err());
        assert_eq!(store.current_version().unwrap(), None);
        assert!(!store.release_dir("1.0.0").exists());
    }

    #[test]
    fn bit_rot_in_a_carried_over_file_is_caught_at_verify_and_leaves_current_untouched() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path().join("store"));
        let mut reporter = crate::reporter::NullReporter;
        let mut events = EventLog::new();
        let fixtures = tempdir().unwrap();
        let downloader = MockDownloader::new(fixtures.path());

        let a = fixture(fixtures.path(), "a.bin", b"alpha");
        let installed = manifest("1.0.0", vec![a.clone()]);
        run_update(
            &store,
            None,
            &installed,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        )
        .unwrap();

        // Corrupt the installed file on disk without touching its manifest
        // entry, simulating bit rot discovered only when the next update
        // tries to carry it over.
        std::fs::write(store.release_dir("1.0.0").join("a.bin"), b"corrupted").unwrap();

        let target = manifest("2.0.0", vec![a]);
        let current = store.current_manifest().unwrap();
        let result = run_update(
            &store,
            current.as_ref(),
            &target,
            &downloader,
            &UpdateOptions::default(),
            &mut events,
            &mut reporter,
        );

        assert!(result.is_err());
        assert_eq!(store.current_version().unwrap(), Some("1.0.0".to_string()));
        assert!(!store.release_dir("2.0.0").exists());
    }
}
