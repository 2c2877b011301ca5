//! Fleet eligibility: does the installed release match what a coordinator
//! requires for this worker to participate in networked work?

use anyhow::Result;
use packmule_store::ReleaseStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    /// Installed `(tool_version, manifest_hash)` matches the requirement.
    Eligible,
    /// Something is installed but does not match the requirement.
    Outdated,
    /// Nothing is installed (no `current` pointer, or it names a release
    /// directory that doesn't actually exist on disk — spec §9 open
    /// question, resolved in DESIGN.md as equivalent to "no installation").
    Absent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub eligibility: Eligibility,
    pub required_version: String,
    pub required_manifest_hash: String,
    pub installed_version: Option<String>,
    pub installed_manifest_hash: Option<String>,
}

/// Query eligibility per spec §4.6: given a required
/// `(tool_version, manifest_hash)`, compare against the installed release's
/// manifest.
pub fn check_eligibility(
    store: &ReleaseStore,
    required_version: &str,
    required_manifest_hash: &str,
) -> Result<EligibilityReport> {
    let installed = store.current_manifest()?;

    let (eligibility, installed_version, installed_manifest_hash) = match installed {
        None => (Eligibility::Absent, None, None),
        Some(manifest) => {
            let matches = manifest.tool_version == required_version
                && manifest.manifest_hash == required_manifest_hash;
            let eligibility = if matches {
                Eligibility::Eligible
            } else {
                Eligibility::Outdated
            };
            (
                eligibility,
                Some(manifest.tool_version),
                Some(manifest.manifest_hash),
            )
        }
    };

    Ok(EligibilityReport {
        eligibility,
        required_version: required_version.to_string(),
        required_manifest_hash: required_manifest_hash.to_string(),
        installed_version,
        installed_manifest_hash,
    })
}
