//! Configuration for the call recorder.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (S3_*, AWS_* credentials, LIVEKIT_*, RECORD_AUDIO_EGRESS, CALLREC_DB)
//! 2. Config file (--config, $CALLREC_CONFIG, or .callrec/config.yaml)
//! 3. Defaults (~/.callrec)
//!
//! Config file discovery:
//! - Searches current directory and parents for .callrec/config.yaml
//! - A relative database path is resolved against the config file's parent directory
//!
//! The environment is read once, here. Resolved credentials are handed to
//! client constructors explicitly; nothing downstream looks at the
//! environment or at ambient cloud profiles.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::RetryPolicy;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub egress: EgressSection,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub artifacts: ArtifactsSection,
    #[serde(default = "default_true")]
    pub dedupe_consecutive: bool,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            database: DatabaseSection::default(),
            storage: StorageSection::default(),
            egress: EgressSection::default(),
            batch: BatchConfig::default(),
            retry: RetryPolicy::default(),
            shutdown: ShutdownConfig::default(),
            artifacts: ArtifactsSection::default(),
            dedupe_consecutive: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseSection {
    /// SQLite file (relative to the config file's parent)
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub force_path_style: Option<bool>,
    pub sse: Option<String>,
    pub sse_kms_key_id: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EgressSection {
    pub enabled: Option<bool>,
    pub ws_url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Batch flush triggers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Flush once this many events are unflushed (default: 50)
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Flush at least this often while events are pending (default: 400ms)
    #[serde(default = "default_batch_interval")]
    pub interval_ms: u64,
}

fn default_batch_size() -> usize {
    50
}
fn default_batch_interval() -> u64 {
    400
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            interval_ms: default_batch_interval(),
        }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Deadlines for session teardown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Whole draining + finalizing sequence (default: 20s)
    #[serde(default = "default_deadline")]
    pub deadline_ms: u64,

    /// Final buffer flush (default: 5s)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Transcript upload including retries (default: 10s)
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_ms: u64,

    /// Egress stop including confirmation (default: 10s)
    #[serde(default = "default_egress_stop_timeout")]
    pub egress_stop_timeout_ms: u64,

    /// Each artifact row and the call end marker (default: 2s)
    #[serde(default = "default_bookkeeping_timeout")]
    pub bookkeeping_timeout_ms: u64,
}

fn default_deadline() -> u64 {
    20_000
}
fn default_drain_timeout() -> u64 {
    5_000
}
fn default_upload_timeout() -> u64 {
    10_000
}
fn default_egress_stop_timeout() -> u64 {
    10_000
}
fn default_bookkeeping_timeout() -> u64 {
    2_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            deadline_ms: default_deadline(),
            drain_timeout_ms: default_drain_timeout(),
            upload_timeout_ms: default_upload_timeout(),
            egress_stop_timeout_ms: default_egress_stop_timeout(),
            bookkeeping_timeout_ms: default_bookkeeping_timeout(),
        }
    }
}

impl ShutdownConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }
    pub fn egress_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.egress_stop_timeout_ms)
    }
    pub fn bookkeeping_timeout(&self) -> Duration {
        Duration::from_millis(self.bookkeeping_timeout_ms)
    }
}

/// Static object-store credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Resolved object-store settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub force_path_style: bool,
    pub sse: Option<String>,
    pub sse_kms_key_id: Option<String>,
    pub credentials: Credentials,
}

impl StorageConfig {
    /// Create a config with the default region and prefix
    pub fn new(bucket: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            bucket: bucket.into(),
            region: "us-east-1".to_string(),
            endpoint: None,
            prefix: "recordings/".to_string(),
            force_path_style: false,
            sse: None,
            sse_kms_key_id: None,
            credentials,
        }
    }
}

/// Resolved media-platform settings
#[derive(Clone, PartialEq, Eq)]
pub struct EgressConfig {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub poll_interval_ms: u64,
    pub stop_timeout_ms: u64,
}

impl std::fmt::Debug for EgressConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressConfig")
            .field("ws_url", &self.ws_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("stop_timeout_ms", &self.stop_timeout_ms)
            .finish()
    }
}

impl EgressConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// SQLite database file
    pub database_path: PathBuf,
    /// Object storage (None = transcript upload disabled)
    pub storage: Option<StorageConfig>,
    /// Audio egress (None = egress disabled)
    pub egress: Option<EgressConfig>,
    pub batch: BatchConfig,
    pub retry: RetryPolicy,
    pub shutdown: ShutdownConfig,
    pub artifacts_enabled: bool,
    pub dedupe_consecutive: bool,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl RecorderConfig {
    /// Load configuration from all sources
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_file = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var("CALLREC_CONFIG")
                .ok()
                .map(PathBuf::from)
                .or_else(find_config_file),
        };

        let file = match config_file {
            Some(ref path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };

        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".callrec");

        Ok(resolve(
            file,
            config_file,
            &default_home,
            |key| std::env::var(key).ok(),
        ))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".callrec").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Merge file values with environment overrides
fn resolve<F>(
    file: ConfigFile,
    config_file: Option<PathBuf>,
    default_home: &Path,
    env: F,
) -> RecorderConfig
where
    F: Fn(&str) -> Option<String>,
{
    let env_any = |keys: &[&str]| keys.iter().find_map(|k| env(k).filter(|v| !v.is_empty()));

    let base_dir = config_file
        .as_ref()
        .and_then(|p| p.parent()) // .callrec/
        .and_then(|p| p.parent()) // project root
        .map(Path::to_path_buf);

    let database_path = if let Some(path) = env_any(&["CALLREC_DB"]) {
        PathBuf::from(path)
    } else if let (Some(path), Some(base)) = (file.database.path.as_deref(), base_dir.as_deref()) {
        resolve_path(base, path)
    } else if let Some(path) = file.database.path.as_deref() {
        PathBuf::from(path)
    } else {
        default_home.join("callrec.db")
    };

    let s = &file.storage;
    let storage = resolve_storage(
        env_any(&["S3_BUCKET"]).or_else(|| s.bucket.clone()),
        env_any(&["S3_ACCESS_KEY_ID", "AWS_ACCESS_KEY_ID"]).or_else(|| s.access_key_id.clone()),
        env_any(&["S3_SECRET_ACCESS_KEY", "AWS_SECRET_ACCESS_KEY"])
            .or_else(|| s.secret_access_key.clone()),
    )
    .map(|(bucket, access_key_id, secret_access_key)| StorageConfig {
        bucket,
        region: env_any(&["S3_REGION"])
            .or_else(|| s.region.clone())
            .unwrap_or_else(|| "us-east-1".to_string()),
        endpoint: env_any(&["S3_ENDPOINT"]).or_else(|| s.endpoint.clone()),
        prefix: env_any(&["S3_PREFIX"])
            .or_else(|| s.prefix.clone())
            .unwrap_or_else(|| "recordings/".to_string()),
        force_path_style: env_any(&["S3_FORCE_PATH_STYLE"])
            .map(|v| v == "1")
            .or(s.force_path_style)
            .unwrap_or(false),
        sse: env_any(&["S3_SSE"]).or_else(|| s.sse.clone()),
        sse_kms_key_id: env_any(&["S3_SSE_KMS_KEY_ID"]).or_else(|| s.sse_kms_key_id.clone()),
        credentials: Credentials {
            access_key_id,
            secret_access_key,
            session_token: env_any(&["S3_SESSION_TOKEN", "AWS_SESSION_TOKEN"])
                .or_else(|| s.session_token.clone()),
        },
    });

    let e = &file.egress;
    let egress_enabled = env_any(&["RECORD_AUDIO_EGRESS"])
        .map(|v| v == "1")
        .or(e.enabled)
        .unwrap_or(true);
    let egress = match (
        egress_enabled,
        env_any(&["LIVEKIT_WS_URL"]).or_else(|| e.ws_url.clone()),
        env_any(&["LIVEKIT_API_KEY"]).or_else(|| e.api_key.clone()),
        env_any(&["LIVEKIT_API_SECRET"]).or_else(|| e.api_secret.clone()),
    ) {
        (true, Some(ws_url), Some(api_key), Some(api_secret)) => Some(EgressConfig {
            ws_url,
            api_key,
            api_secret,
            poll_interval_ms: e.poll_interval_ms.unwrap_or(500),
            stop_timeout_ms: e.stop_timeout_ms.unwrap_or(8_000),
        }),
        (false, ..) => {
            debug!("Audio egress disabled by configuration");
            None
        }
        _ => {
            debug!("Audio egress not configured: missing LIVEKIT_{{WS_URL,API_KEY,API_SECRET}}");
            None
        }
    };

    RecorderConfig {
        database_path,
        storage,
        egress,
        batch: file.batch,
        retry: file.retry,
        shutdown: file.shutdown,
        artifacts_enabled: file.artifacts.enabled,
        dedupe_consecutive: file.dedupe_consecutive,
        config_file,
    }
}

fn resolve_storage(
    bucket: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
) -> Option<(String, String, String)> {
    match (bucket, access_key_id, secret_access_key) {
        (Some(bucket), Some(key), Some(secret)) => Some((bucket, key, secret)),
        (None, ..) => {
            debug!("Object storage not configured: S3_BUCKET unset");
            None
        }
        _ => {
            debug!("Object storage not configured: missing access key or secret");
            None
        }
    }
}
