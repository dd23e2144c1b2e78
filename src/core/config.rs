//! Registry configuration
//!
//! Resolved once at process start (from the environment, a TOML file, or
//! built in code) and passed explicitly to [`CardRegistry::open`]. Nothing
//! in the crate reads configuration after that.
//!
//! ```toml
//! tracking_uri = "sqlite:///var/lib/cardvault/tracking.db"
//! storage_uri = "s3://ml-artifacts/registry"
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 10
//! max_delay_ms = 1000
//! jitter = true
//!
//! [compression]
//! method = "zstd"
//! threshold = 1024
//! min_ratio = 0.9
//! ```
//!
//! [`CardRegistry::open`]: crate::registry::CardRegistry::open

use crate::codec::CompressionConfig;
use crate::error::{RegistryError, Result};
use crate::retry::RetrySettings;
use crate::storage::{StorageSystem, StorageUri};
use crate::tracking::TrackingUri;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{Validate, ValidationError};

pub const TRACKING_URI_ENV: &str = "CARDVAULT_TRACKING_URI";
pub const STORAGE_URI_ENV: &str = "CARDVAULT_STORAGE_URI";
pub const RETRY_MAX_ATTEMPTS_ENV: &str = "CARDVAULT_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_DELAY_MS_ENV: &str = "CARDVAULT_RETRY_BASE_DELAY_MS";
pub const RESERVATION_MAX_ATTEMPTS_ENV: &str = "CARDVAULT_RESERVATION_MAX_ATTEMPTS";

pub const DEFAULT_TRACKING_URI: &str = "sqlite://cardvault.db";
pub const DEFAULT_STORAGE_URI: &str = "./cardvault-artifacts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RegistryConfig {
    /// `sqlite://<path>`, `sqlite::memory:` or `memory://`
    #[validate(custom(function = "validate_tracking_uri"))]
    pub tracking_uri: String,

    /// Local path, `file://`, `memory://`, `s3://bucket/prefix` or `gs://bucket/prefix`
    #[validate(custom(function = "validate_storage_uri"))]
    pub storage_uri: String,

    /// Transient storage and tracking-store failures
    #[validate(custom(function = "validate_retry"))]
    pub retry: RetrySettings,

    /// Lost version races
    #[validate(custom(function = "validate_retry"))]
    pub reservation: RetrySettings,

    #[validate(custom(function = "validate_compression"))]
    pub compression: CompressionConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            tracking_uri: DEFAULT_TRACKING_URI.to_string(),
            storage_uri: DEFAULT_STORAGE_URI.to_string(),
            retry: RetrySettings::default(),
            reservation: RetrySettings {
                max_attempts: 32,
                base_delay_ms: 1,
                max_delay_ms: 100,
                jitter: true,
            },
            compression: CompressionConfig::default(),
        }
    }
}

fn validate_tracking_uri(uri: &str) -> std::result::Result<(), ValidationError> {
    TrackingUri::parse(uri)
        .map(|_| ())
        .map_err(|_| ValidationError::new("tracking_uri"))
}

fn validate_storage_uri(uri: &str) -> std::result::Result<(), ValidationError> {
    StorageUri::parse(uri)
        .map(|_| ())
        .map_err(|_| ValidationError::new("storage_uri"))
}

fn validate_retry(retry: &RetrySettings) -> std::result::Result<(), ValidationError> {
    if retry.max_attempts == 0 || retry.max_attempts > 10_000 {
        return Err(ValidationError::new("max_attempts"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        return Err(ValidationError::new("base_delay_ms"));
    }
    Ok(())
}

fn validate_compression(config: &CompressionConfig) -> std::result::Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&config.min_ratio) {
        return Err(ValidationError::new("min_ratio"));
    }
    Ok(())
}

impl RegistryConfig {
    /// In-memory tracking and storage; nothing touches disk
    pub fn in_memory() -> Self {
        RegistryConfig {
            tracking_uri: "memory://".to_string(),
            storage_uri: "memory://".to_string(),
            ..Default::default()
        }
    }

    /// SQLite tracking file and local artifact directory under `root`
    pub fn local<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        RegistryConfig {
            tracking_uri: format!("sqlite://{}", root.join("tracking.db").display()),
            storage_uri: root.join("artifacts").display().to_string(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `CARDVAULT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RegistryConfig::default();

        if let Some(uri) = lookup(TRACKING_URI_ENV) {
            config.tracking_uri = uri;
        }
        if let Some(uri) = lookup(STORAGE_URI_ENV) {
            config.storage_uri = uri;
        }
        if let Some(raw) = lookup(RETRY_MAX_ATTEMPTS_ENV) {
            config.retry.max_attempts = parse_env(RETRY_MAX_ATTEMPTS_ENV, &raw)?;
        }
        if let Some(raw) = lookup(RETRY_BASE_DELAY_MS_ENV) {
            config.retry.base_delay_ms = parse_env(RETRY_BASE_DELAY_MS_ENV, &raw)?;
        }
        if let Some(raw) = lookup(RESERVATION_MAX_ATTEMPTS_ENV) {
            config.reservation.max_attempts = parse_env(RESERVATION_MAX_ATTEMPTS_ENV, &raw)?;
        }

        config.check()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: RegistryConfig = toml::from_str(raw)
            .map_err(|e| RegistryError::Config(format!("invalid TOML config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RegistryError::Config(format!("cannot serialize config: {}", e)))
    }

    /// Run field validation, mapping failures to `Config`
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| RegistryError::Config(e.to_string()))
    }

    pub fn tracking(&self) -> Result<TrackingUri> {
        TrackingUri::parse(&self.tracking_uri)
    }

    pub fn storage(&self) -> Result<StorageUri> {
        StorageUri::parse(&self.storage_uri)
    }

    /// Backend family selected by the storage URI
    pub fn storage_system(&self) -> Result<StorageSystem> {
        Ok(self.storage()?.system())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| RegistryError::Config(format!("{} has invalid value '{}'", key, raw)))
}
