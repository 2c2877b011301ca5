//! On-disk layout for a tool's installed releases.
//!
//! ```text
//! <tool_root>/
//!   current                 -- text file, contents "v<version>"
//!   releases/
//!     v<version>/            -- one directory per installed release
//!       manifest.json
//!       ...release files...
//!     .staging/
//!       v<version>/          -- scratch area, not yet promoted
//! ```
//!
//! This crate owns the path layout and the low-level, crash-safe
//! filesystem operations (prepare staging, promote, flip pointer, reclaim).
//! The activation *protocol* — which steps run in which order, and how
//! download/verify fit between them — lives in `packmule-core`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use packmule_manifest::Manifest;

pub const RELEASES_DIR: &str = "releases";
pub const STAGING_DIR: &str = ".staging";
pub const CURRENT_POINTER: &str = "current";
pub const MANIFEST_FILE: &str = "manifest.json";

pub struct ReleaseStore {
    root: PathBuf,
}

impl ReleaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join(RELEASES_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.releases_dir().join(STAGING_DIR)
    }

    pub fn staging_version_dir(&self, version: &str) -> PathBuf {
        self.staging_dir().join(format!("v{version}"))
    }

    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.releases_dir().join(format!("v{version}"))
    }

    pub fn current_pointer_path(&self) -> PathBuf {
        self.root.join(CURRENT_POINTER)
    }

    /// Read the `current` pointer, returning the bare version string (no
    /// `v` prefix), or `None` if nothing is installed yet.
    pub fn current_version(&self) -> Result<Option<String>> {
        let pointer_path = self.current_pointer_path();
        if !pointer_path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&pointer_path)
            .with_context(|| format!("failed to read {}", pointer_path.display()))?;
        let trimmed = contents.trim();
        let version = trimmed
            .strip_prefix('v')
            .with_context(|| format!("malformed current pointer: {trimmed:?}"))?;
        Ok(Some(version.to_string()))
    }

    /// Directory of the currently active release, if any. Does not verify
    /// the directory actually exists on disk (see spec §9 Open Question:
    /// a dangling pointer is treated as `absent` by the caller, not here).
    pub fn current_release_dir(&self) -> Result<Option<PathBuf>> {
        Ok(self.current_version()?.map(|v| self.release_dir(&v)))
    }

    /// Load the manifest of the currently active release. Returns `None`
    /// if no release is installed, or if the pointer names a release
    /// directory that doesn't actually exist on disk.
    pub fn current_manifest(&self) -> Result<Option<Manifest>> {
        let Some(dir) = self.current_release_dir()? else {
            return Ok(None);
        };
        Manifest::load_optional(&dir.join(MANIFEST_FILE))
    }

    /// Step 1 of the activation protocol: remove any pre-existing staging
    /// directory for `version`, then create it fresh.
    pub fn prepare_staging(&self, version: &str) -> Result<PathBuf> {
        let dir = self.staging_version_dir(version);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clear stale staging dir {}", dir.display()))?;
        }
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create staging dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Discard a staging directory without promoting it (used on verify
    /// failure per §4.6 step 4).
    pub fn discard_staging(&self, version: &str) -> Result<()> {
        let dir = self.staging_version_dir(version);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove staging dir {}", dir.display()))?;
        }
        Ok(())
    }

    /// Step 6: rename the staging directory over the final release
    /// directory. This rename is the commit point — if the destination
    /// already exists (e.g. a retried update) it is removed first.
    pub fn promote(&self, version: &str) -> Result<()> {
        let staging = self.staging_version_dir(version);
        let dest = self.release_dir(version);

        if dest.exists() {
            std::fs::remove_dir_all(&dest)
                .with_context(|| format!("failed to remove existing {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::rename(&staging, &dest).with_context(|| {
            format!(
                "failed to promote {} to {}",
                staging.display(),
                dest.display()
            )
        })?;
        Ok(())
    }

    /// Step 7: overwrite `current` with `"v<version>"` via write-then-rename
    /// of a temp file in the same directory.
    pub fn flip_pointer(&self, version: &str) -> Result<()> {
        let pointer_path = self.current_pointer_path();
        packmule_hash::atomic_write(&pointer_path, format!("v{version}").as_bytes())
    }

    /// Step 8: remove the previous release directory (if present) and any
    /// now-empty staging directory. Safe to retry.
    pub fn reclaim(&self, previous_version: Option<&str>) -> Result<()> {
        if let Some(previous) = previous_version {
            let dir = self.release_dir(previous);
            if dir.exists() {
                self.assert_removable(&dir)?;
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("failed to reclaim {}", dir.display()))?;
            }
        }

        let staging = self.staging_dir();
        if staging.exists()
            && std::fs::read_dir(&staging)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false)
        {
            std::fs::remove_dir(&staging)
                .with_context(|| format!("failed to remove empty staging dir {}", staging.display()))?;
        }

        Ok(())
    }

    /// Enforce `delete_policy = "safe"` (§4.5): no path-level deletion is
    /// permitted outside `releases/<version>/`. The store root, the
    /// `current` pointer, and the staging directory itself are never
    /// candidates for removal through this path.
    pub fn assert_removable(&self, path: &Path) -> Result<()> {
        let releases_dir = self.releases_dir();
        if path == releases_dir || path == self.root || path == self.staging_dir() {
            bail!("refusing to remove protected directory {}", path.display());
        }
        if !path.starts_with(&releases_dir) {
            bail!(
                "refusing to remove {} outside of {}",
                path.display(),
                releases_dir.display()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packmule_manifest::DeletePolicy;
    use tempfile::tempdir;

    fn sample_manifest(tool_version: &str) -> Manifest {
        Manifest::new(
            "demo",
            tool_version,
            chrono::Utc::now(),
            vec![],
            DeletePolicy::Safe,
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn current_version_is_none_before_first_activation() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());
        assert_eq!(store.current_version().unwrap(), None);
        assert_eq!(store.current_manifest().unwrap().is_none(), true);
    }

    #[test]
    fn prepare_staging_clears_stale_scratch() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());

        let dir = store.prepare_staging("1.0.0").unwrap();
        std::fs::write(dir.join("stale.txt"), b"old").unwrap();

        let dir2 = store.prepare_staging("1.0.0").unwrap();
        assert!(!dir2.join("stale.txt").exists());
    }

    #[test]
    fn full_activation_sequence_flips_pointer_and_reclaims_previous() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());

        // Simulate an already-installed v1.0.0.
        let v1_dir = store.release_dir("1.0.0");
        std::fs::create_dir_all(&v1_dir).unwrap();
        sample_manifest("1.0.0")
            .save(&v1_dir.join(MANIFEST_FILE))
            .unwrap();
        store.flip_pointer("1.0.0").unwrap();

        assert_eq!(store.current_version().unwrap(), Some("1.0.0".to_string()));

        // Stage and promote v2.0.0.
        let staging = store.prepare_staging("2.0.0").unwrap();
        sample_manifest("2.0.0")
            .save(&staging.join(MANIFEST_FILE))
            .unwrap();
        store.promote("2.0.0").unwrap();
        store.flip_pointer("2.0.0").unwrap();

        assert_eq!(store.current_version().unwrap(), Some("2.0.0".to_string()));
        assert!(store.release_dir("2.0.0").join(MANIFEST_FILE).exists());

        store.reclaim(Some("1.0.0")).unwrap();
        assert!(!v1_dir.exists());
    }

    #[test]
    fn promote_overwrites_existing_destination() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());

        let dest = store.release_dir("1.0.0");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("old.txt"), b"old").unwrap();

        let staging = store.prepare_staging("1.0.0").unwrap();
        std::fs::write(staging.join("new.txt"), b"new").unwrap();
        store.promote("1.0.0").unwrap();

        assert!(!dest.join("old.txt").exists());
        assert!(dest.join("new.txt").exists());
    }

    #[test]
    fn reclaim_removes_empty_staging_directory() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());
        std::fs::create_dir_all(store.staging_dir()).unwrap();
        store.reclaim(None).unwrap();
        assert!(!store.staging_dir().exists());
    }

    #[test]
    fn assert_removable_rejects_paths_outside_releases() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());
        assert!(store.assert_removable(&store.root().join("current")).is_err());
        assert!(store.assert_removable(store.root()).is_err());
        assert!(store.assert_removable(&store.releases_dir()).is_err());
    }

    #[test]
    fn assert_removable_allows_versioned_release_dirs() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());
        assert!(store.assert_removable(&store.release_dir("1.0.0")).is_ok());
    }

    #[test]
    fn current_manifest_returns_none_for_dangling_pointer() {
        let td = tempdir().unwrap();
        let store = ReleaseStore::new(td.path());
        store.flip_pointer("9.9.9").unwrap();
        // release_dir("9.9.9") was never created.
        assert!(store.current_manifest().unwrap().is_none());
    }
}
