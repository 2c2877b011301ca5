//! Workspace/worker-local configuration: an optional `.packmule.toml` plus
//! the single environment variable spec §6 names for manifest generation.
//!
//! Follows the teacher's `shipper::config` conventions: nested structs with
//! `#[serde(default = "...")]` nearly everywhere, and a dual string-or-millis
//! duration deserializer so config files can write `"30s"` or a raw
//! millisecond integer.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use packmule_retry::RetryPolicy;

/// Deserialize a `Duration` from either a human-readable string (`"30s"`)
/// or a raw `u64` (milliseconds).
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a `Duration` as milliseconds so it round-trips through
/// [`deserialize_duration`].
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

pub const BASE_URL_ENV: &str = "PACKMULE_BASE_URL";
pub const DEFAULT_BASE_URL: &str = "https://updates.packmule.invalid";
pub const CONFIG_FILE_NAME: &str = ".packmule.toml";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_fan_out() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_lock_timeout"
    )]
    pub timeout: Duration,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_connect_timeout"
    )]
    pub connect_timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_inactivity_timeout"
    )]
    pub inactivity_timeout: Duration,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            inactivity_timeout: default_inactivity_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrySection {
    #[serde(default)]
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSection {
    /// Bounded fan-out for concurrent file downloads within one update run
    /// (spec §5: small default, e.g. 4).
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,
}

impl Default for ParallelSection {
    fn default() -> Self {
        Self {
            fan_out: default_fan_out(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackmuleConfig {
    /// Default download base URL for manifest generation, overridden at
    /// runtime by the [`BASE_URL_ENV`] environment variable if set.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub parallel: ParallelSection,
}

impl Default for PackmuleConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            lock: LockSection::default(),
            network: NetworkSection::default(),
            retry: RetrySection::default(),
            parallel: ParallelSection::default(),
        }
    }
}

impl PackmuleConfig {
    /// Load `.packmule.toml` from `path`, or fall back to defaults if the
    /// file doesn't exist. A present-but-malformed file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("config file {} is malformed TOML", path.display()))
    }

    /// Discover `.packmule.toml` in `dir` and load it, falling back to
    /// defaults if absent.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load(&dir.join(CONFIG_FILE_NAME))
    }

    /// Resolve the base URL for manifest generation per spec §6: the
    /// [`BASE_URL_ENV`] environment variable, if set, otherwise this
    /// config's `base_url`.
    pub fn resolved_base_url(&self) -> String {
        std::env::var(BASE_URL_ENV).unwrap_or_else(|_| self.base_url.clone())
    }
}
