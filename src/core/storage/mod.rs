//! Byte-oriented storage backends for card artifacts
//!
//! Every backend implements [`StorageClient`] with the same contract:
//! paths are `/`-separated keys relative to the backend root, `get` on a
//! missing key is `NotFound`, and `list` walks a prefix once.
//!
//! Object stores give no list-after-put guarantee, so the registry only ever
//! reads an artifact back by its exact path.

mod local;
mod memory;
#[cfg(feature = "s3")]
mod object;

pub use local::LocalStorage;
pub use memory::MemoryStorage;
#[cfg(feature = "s3")]
pub use object::ObjectStorage;

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Lazy, single-pass enumeration of stored paths
pub type PathIter<'a> = Box<dyn Iterator<Item = Result<String>> + Send + 'a>;

/// Uniform interface over a storage backend
pub trait StorageClient: Send + Sync {
    /// Backend family of this client
    fn system(&self) -> StorageSystem;

    /// Root URI every path is relative to
    fn root_uri(&self) -> String;

    /// Write `data` at `path`, creating intermediate structure as needed
    fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read the full content at `path`
    fn get(&self, path: &str) -> Result<Vec<u8>>;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Size in bytes of the content at `path`
    fn size(&self, path: &str) -> Result<u64>;

    /// Enumerate every path under `prefix`
    fn list(&self, prefix: &str) -> Result<PathIter<'_>>;

    /// Best-effort removal; deleting a missing path is not an error
    fn delete(&self, path: &str) -> Result<()>;

    /// Whether `rename` is atomic on this backend
    fn supports_rename(&self) -> bool {
        false
    }

    /// Atomically move `from` to `to`
    fn rename(&self, from: &str, _to: &str) -> Result<()> {
        Err(RegistryError::storage(
            from,
            format!("{:?} storage does not support rename", self.system()),
        ))
    }
}

/// Storage backend family, derived from the storage URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageSystem {
    Local,
    Memory,
    S3,
    Gcs,
}

/// Parsed storage root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    Local(PathBuf),
    Memory,
    S3 { bucket: String, prefix: String },
    Gcs { bucket: String, prefix: String },
}

impl StorageUri {
    /// Parse `memory://`, `s3://bucket/prefix`, `gs://bucket/prefix`,
    /// `file:///path` or a bare filesystem path (made absolute)
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(RegistryError::Config(
                "storage URI cannot be empty".to_string(),
            ));
        }

        if uri == "memory://" || uri == "memory" {
            return Ok(StorageUri::Memory);
        }

        if let Some(rest) = uri.strip_prefix("s3://") {
            let (bucket, prefix) = split_bucket(uri, rest)?;
            return Ok(StorageUri::S3 { bucket, prefix });
        }

        if let Some(rest) = uri.strip_prefix("gs://") {
            let (bucket, prefix) = split_bucket(uri, rest)?;
            return Ok(StorageUri::Gcs { bucket, prefix });
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        if path.contains("://") {
            return Err(RegistryError::Config(format!(
                "unsupported storage URI scheme in '{}'",
                uri
            )));
        }

        Ok(StorageUri::Local(absolute(Path::new(path))?))
    }

    pub fn system(&self) -> StorageSystem {
        match self {
            StorageUri::Local(_) => StorageSystem::Local,
            StorageUri::Memory => StorageSystem::Memory,
            StorageUri::S3 { .. } => StorageSystem::S3,
            StorageUri::Gcs { .. } => StorageSystem::Gcs,
        }
    }
}

fn split_bucket(uri: &str, rest: &str) -> Result<(String, String)> {
    let (bucket, prefix) = match rest.split_once('/') {
        Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
        None => (rest, ""),
    };
    if bucket.is_empty() {
        return Err(RegistryError::Config(format!(
            "storage URI '{}' is missing a bucket",
            uri
        )));
    }
    Ok((bucket.to_string(), prefix.to_string()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Reject keys that could escape the storage root
pub(crate) fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(RegistryError::storage(path, "path cannot be empty"));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(RegistryError::storage(path, "path must be relative and '/'-separated"));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(RegistryError::storage(path, "path contains an empty or relative segment"));
    }
    Ok(())
}

/// Open the backend selected by `uri`
pub fn open_storage(uri: &StorageUri) -> Result<Arc<dyn StorageClient>> {
    match uri {
        StorageUri::Local(root) => Ok(Arc::new(LocalStorage::new(root)?)),
        StorageUri::Memory => Ok(Arc::new(MemoryStorage::new())),
        #[cfg(feature = "s3")]
        StorageUri::S3 { bucket, prefix } => Ok(Arc::new(ObjectStorage::s3(bucket, prefix)?)),
        #[cfg(feature = "s3")]
        StorageUri::Gcs { bucket, prefix } => Ok(Arc::new(ObjectStorage::gcs(bucket, prefix)?)),
        #[cfg(not(feature = "s3"))]
        StorageUri::S3 { .. } | StorageUri::Gcs { .. } => Err(RegistryError::Config(
            "object storage requires the 's3' feature. Enable with: cargo build --features s3"
                .to_string(),
        )),
    }
}
