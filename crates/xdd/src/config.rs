//! Configuration file support (`xdd.toml`).
//!
//! All knobs default sensibly; a missing file is the common case and yields
//! the defaults. The file lives in the project root, next to the artifact
//! directory it configures.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::lock::LockOptions;
use crate::repository::{DEFAULT_SNAPSHOT_THRESHOLD, RepositoryOptions};

pub const CONFIG_FILE: &str = "xdd.toml";

/// Deserialize a Duration from either a string (human-readable) or u64
/// (milliseconds).
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
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with
/// `deserialize_duration`.
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Nested lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    /// Age after which a lock holder is considered stale.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_stale_after")]
    pub stale_after: Duration,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
        }
    }
}

fn default_stale_after() -> Duration {
    Duration::from_secs(30 * 60)
}

/// Nested snapshot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSection {
    /// Appended-event count that triggers a snapshot.
    #[serde(default = "default_snapshot_threshold")]
    pub threshold: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            threshold: default_snapshot_threshold(),
        }
    }
}

fn default_snapshot_threshold() -> u64 {
    DEFAULT_SNAPSHOT_THRESHOLD
}

/// Nested structured-generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorSection {
    /// OpenAI-compatible API base, e.g. `https://openrouter.ai/api/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier passed through to the provider.
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable the API key is read from. Keys never live in the
    /// config file itself.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Per-request timeout.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_generator_timeout")]
    pub timeout: Duration,
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout: default_generator_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_generator_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Configuration loaded from `xdd.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XddConfig {
    /// Name of the artifact directory under the project root.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    #[serde(default)]
    pub lock: LockSection,

    #[serde(default)]
    pub snapshot: SnapshotSection,

    #[serde(default)]
    pub generator: GeneratorSection,
}

impl Default for XddConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            lock: LockSection::default(),
            snapshot: SnapshotSection::default(),
            generator: GeneratorSection::default(),
        }
    }
}

fn default_artifact_dir() -> String {
    ".xdd".to_string()
}

impl XddConfig {
    /// Artifact root for a project root.
    pub fn artifact_root(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.artifact_dir)
    }

    /// Repository options derived from this configuration.
    pub fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions {
            snapshot_threshold: self.snapshot.threshold,
            lock: LockOptions {
                stale_after: self.lock.stale_after,
            },
        }
    }
}

/// Load `<project_root>/xdd.toml`, or defaults when absent.
pub fn load_config(project_root: &Path) -> Result<XddConfig> {
    load_config_from(&project_root.join(CONFIG_FILE))
}

/// Load a config file at an explicit path, or defaults when absent.
pub fn load_config_from(path: &Path) -> Result<XddConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(XddConfig::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config {}", path.display()));
        }
    };
    toml::from_str(&content).with_context(|| format!("failed to parse config {}", path.display()))
}
