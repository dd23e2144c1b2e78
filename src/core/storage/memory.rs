//! In-process backend for tests and ephemeral registries

use super::{validate_path, PathIter, StorageClient, StorageSystem};
use crate::error::{RegistryError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl StorageClient for MemoryStorage {
    fn system(&self) -> StorageSystem {
        StorageSystem::Memory
    }

    fn root_uri(&self) -> String {
        "memory://".to_string()
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        validate_path(path)?;
        self.objects.write().insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(format!("no artifact at '{}'", path)))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        validate_path(path)?;
        Ok(self.objects.read().contains_key(path))
    }

    fn size(&self, path: &str) -> Result<u64> {
        validate_path(path)?;
        self.objects
            .read()
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or_else(|| RegistryError::NotFound(format!("no artifact at '{}'", path)))
    }

    fn list(&self, prefix: &str) -> Result<PathIter<'_>> {
        let keys: Vec<String> = self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        self.objects.write().remove(path);
        Ok(())
    }

    fn supports_rename(&self) -> bool {
        true
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        validate_path(from)?;
        validate_path(to)?;
        let mut objects = self.objects.write();
        let data = objects
            .remove(from)
            .ok_or_else(|| RegistryError::NotFound(format!("no artifact at '{}'", from)))?;
        objects.insert(to.to_string(), data);
        Ok(())
    }
}
