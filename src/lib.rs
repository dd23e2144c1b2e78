//! # CardVault - Versioned Registry for ML Cards
//!
//! `cardvault-rs` registers immutable, versioned "cards" describing ML
//! artifacts (datasets, models, experiment runs, pipelines) and resolves them
//! again by uid, by family, or by version requirement.
//!
//! - **Consistent versioning**: each (team, name) family issues strictly
//!   increasing semantic versions, even with many concurrent writers
//! - **Pluggable storage**: local disk, in-memory, and S3/GCS object stores
//!   (the latter behind the `s3` feature)
//! - **Self-describing artifacts**: checksummed, optionally compressed
//!   envelopes for tables, model blobs and JSON documents
//! - **SQLite tracking store** holding the version ledger and card rows
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cardvault_rs::{BumpKind, CardRegistry, DataCardMetadata, NewCard, RegistryConfig, Result};
//!
//! # fn main() -> Result<()> {
//! let registry = CardRegistry::open(&RegistryConfig::from_env()?)?;
//!
//! let card = NewCard::data("fraud", "transactions", DataCardMetadata::default())
//!     .with_tag("source", "warehouse");
//! let registered = registry.register(card, BumpKind::Minor)?;
//! println!("{} v{} at {}", registered.uid, registered.version, registered.storage_path);
//!
//! let latest = registry.resolve("fraud", "transactions", "^0.1")?;
//! let payload = registry.load_artifact(&latest.uid)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Builder
//!
//! ```rust,no_run
//! use cardvault_rs::{RegistryBuilder, Result};
//!
//! # fn main() -> Result<()> {
//! let registry = RegistryBuilder::new()
//!     .tracking_uri("sqlite:///var/lib/cardvault/tracking.db")
//!     .storage_uri("/var/lib/cardvault/artifacts")
//!     .max_retry_attempts(8)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core resolve
#[allow(unused_imports)]
pub(crate) use self::core::{
    allocator, card, codec, config, error, path, registry, retry, storage, tracking, validation,
    version,
};

pub use crate::core::{
    allocator::{Reservation, VersionAllocator},
    card::{
        Card, CardKind, CardMetadata, CardStatus, DataCardMetadata, Metric, ModelCardMetadata,
        NewCard, ParamValue, PipelineCardMetadata, RegisteredCard, RunCardMetadata, Tags,
    },
    codec::{
        Artifact, ArtifactKind, Column, ColumnData, CompressionConfig, CompressionMethod,
        ModelBlob, Table,
    },
    config::RegistryConfig,
    error::{RegistryError, Result},
    registry::CardRegistry,
    retry::{RetryPolicy, RetrySettings},
    storage::{LocalStorage, MemoryStorage, StorageClient, StorageSystem, StorageUri},
    tracking::{AbandonedVersion, CardQuery, Tracking, TrackingUri},
    validation::Slug,
    version::{BumpKind, VersionFilter},
};

#[cfg(feature = "s3")]
pub use crate::core::storage::ObjectStorage;

use std::sync::Arc;
use tracing::{debug, info};

/// Builder for a [`CardRegistry`]
///
/// Starts from [`RegistryConfig::default`]. Backends can be supplied directly
/// instead of by URI, which is how tests wrap storage with fault injection.
pub struct RegistryBuilder {
    config: RegistryConfig,
    tracking: Option<Tracking>,
    storage: Option<Arc<dyn StorageClient>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder {
            config: RegistryConfig::default(),
            tracking: None,
            storage: None,
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: RegistryConfig) -> Self {
        RegistryBuilder {
            config,
            tracking: None,
            storage: None,
        }
    }

    pub fn tracking_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.config.tracking_uri = uri.into();
        self
    }

    pub fn storage_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.config.storage_uri = uri.into();
        self
    }

    /// Attempt budget for transient storage and tracking failures
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.config.retry = retry;
        self
    }

    /// Attempt budget and backoff for lost version races
    pub fn reservation_retry(mut self, retry: RetrySettings) -> Self {
        self.config.reservation = retry;
        self
    }

    pub fn compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    /// Use an already-open tracking store instead of `tracking_uri`
    pub fn with_tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Use an already-open storage client instead of `storage_uri`
    pub fn with_storage(mut self, storage: Arc<dyn StorageClient>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Result<CardRegistry> {
        self.config.check()?;

        let tracking = match self.tracking {
            Some(tracking) => {
                debug!("Using supplied tracking store");
                tracking
            }
            None => tracking::open_tracking(&self.config.tracking()?)?,
        };
        let storage = match self.storage {
            Some(storage) => {
                debug!("Using supplied {:?} storage client", storage.system());
                storage
            }
            None => storage::open_storage(&self.config.storage()?)?,
        };

        info!(
            "Building card registry over {} storage",
            storage.root_uri()
        );

        Ok(CardRegistry::with_policies(
            tracking,
            storage,
            RetryPolicy::from_settings(&self.config.retry),
            RetryPolicy::from_settings(&self.config.reservation),
            self.config.compression,
        ))
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
