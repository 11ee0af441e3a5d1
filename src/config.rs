/// Sync configuration
///
/// Layered with the `config` crate: built-in defaults, then an optional TOML
/// file, then `BOTTLE_SYNC_*` environment variables (nested keys use `__`,
/// e.g. `BOTTLE_SYNC_STORAGE_RETRY__MAX_ATTEMPTS`). The merged result is
/// validated before it is returned.
use crate::error::RetryConfig;
use crate::{SyncError, SyncResult};
use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BOTTLE_SYNC";

const GIB: u64 = 1024 * 1024 * 1024;

/// Where an external hash file comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalSource {
    /// Object key, optionally in another bucket
    S3 { key: String, bucket: Option<String> },

    /// HTTPS URL
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Platforms whose bottles are synced
    pub target_platforms: Vec<String>,

    /// Bottles estimated above this size go to the container worker
    pub size_threshold_gb: u64,

    pub max_concurrent_downloads: usize,

    pub retry_attempts: u32,

    pub slack_webhook_url: Option<String>,

    pub s3_bucket_name: Option<String>,

    pub external_hash_file_s3_key: Option<String>,

    /// Bucket for `external_hash_file_s3_key`; defaults to the sync bucket
    pub external_hash_file_s3_bucket: Option<String>,

    pub external_hash_file_url: Option<String>,

    /// Retry policy for object storage calls
    pub storage_retry: RetryConfig,

    /// Retry policy for upstream API calls
    pub api_retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target_platforms: vec![
                "arm64_sonoma".to_string(),
                "arm64_ventura".to_string(),
                "monterey".to_string(),
            ],
            size_threshold_gb: 20,
            max_concurrent_downloads: 10,
            retry_attempts: 3,
            slack_webhook_url: None,
            s3_bucket_name: None,
            external_hash_file_s3_key: None,
            external_hash_file_s3_bucket: None,
            external_hash_file_url: None,
            storage_retry: RetryConfig::storage(),
            api_retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load defaults, the config file and the environment, then validate.
    ///
    /// With no explicit path, `config.toml` in the platform config directory
    /// is used if it exists.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let file = path.map(Path::to_path_buf).or_else(default_config_path);
        Self::load_from(file.as_deref(), path.is_some())
    }

    fn load_from(file: Option<&Path>, required: bool) -> SyncResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(file) = file {
            tracing::debug!(path = %file.display(), required, "Reading configuration file");
            builder = builder.add_source(
                File::from(file)
                    .format(FileFormat::Toml)
                    .required(required),
            );
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("target_platforms")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.target_platforms.is_empty() {
            return Err(invalid("Target platforms list cannot be empty"));
        }
        if self.target_platforms.iter().any(|p| p.trim().is_empty()) {
            return Err(invalid("Platform name cannot be empty"));
        }
        if self.size_threshold_gb == 0 {
            return Err(invalid("Size threshold must be positive"));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(invalid("Max concurrent downloads must be positive"));
        }

        if let Some(url) = non_empty(&self.slack_webhook_url) {
            if !url.starts_with("https://") {
                return Err(invalid("Slack webhook URL must be HTTPS"));
            }
        }

        let key = non_empty(&self.external_hash_file_s3_key);
        let url = non_empty(&self.external_hash_file_url);
        if key.is_some() && url.is_some() {
            return Err(invalid("Only one external hash file source can be specified"));
        }
        if let Some(key) = key {
            if !key.ends_with(".json") {
                return Err(invalid("External hash file S3 key must end with .json"));
            }
        }
        if let Some(url) = url {
            if !url.starts_with("https://") {
                return Err(invalid("External hash file URL must be HTTPS"));
            }
        }

        self.storage_retry
            .validate()
            .map_err(|e| invalid(&format!("storage_retry: {}", e)))?;
        self.api_retry
            .validate()
            .map_err(|e| invalid(&format!("api_retry: {}", e)))?;
        Ok(())
    }

    /// The configured external hash file source, if any
    pub fn external_source(&self) -> Option<ExternalSource> {
        if let Some(url) = non_empty(&self.external_hash_file_url) {
            return Some(ExternalSource::Url(url.to_string()));
        }
        non_empty(&self.external_hash_file_s3_key).map(|key| ExternalSource::S3 {
            key: key.to_string(),
            bucket: non_empty(&self.external_hash_file_s3_bucket).map(str::to_string),
        })
    }

    /// Size threshold in bytes
    pub fn size_threshold_bytes(&self) -> u64 {
        self.size_threshold_gb.saturating_mul(GIB)
    }

    /// Whether an estimated download size should be routed to the container worker
    pub fn is_large_download(&self, estimated_bytes: u64) -> bool {
        estimated_bytes > self.size_threshold_bytes()
    }
}

fn invalid(message: &str) -> SyncError {
    SyncError::Config(message.to_string())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// `config.toml` under the platform config directory
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("sh", "brew", "bottle-sync")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .filter(|path| path.is_file())
}
