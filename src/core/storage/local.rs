//! Local filesystem backend

use super::{validate_path, PathIter, StorageClient, StorageSystem};
use crate::error::{RegistryError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Artifacts stored as plain files below a root directory
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Open (creating if needed) a storage root
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| map_io(&root.to_string_lossy(), e))?;
        debug!("Local storage rooted at {}", root.display());
        Ok(LocalStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        validate_path(path)?;
        Ok(path.split('/').fold(self.root.clone(), |acc, seg| acc.join(seg)))
    }
}

/// Translate an I/O error into the registry taxonomy
fn map_io(path: &str, err: std::io::Error) -> RegistryError {
    match err.kind() {
        ErrorKind::NotFound => RegistryError::NotFound(format!("no artifact at '{}'", path)),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            RegistryError::transient(path, err.to_string())
        }
        _ => RegistryError::storage(path, err.to_string()),
    }
}

impl StorageClient for LocalStorage {
    fn system(&self) -> StorageSystem {
        StorageSystem::Local
    }

    fn root_uri(&self) -> String {
        format!("file://{}", self.root.display())
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| map_io(path, e))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .map_err(|e| map_io(path, e))?;
        file.write_all(data).map_err(|e| map_io(path, e))?;
        file.sync_all().map_err(|e| map_io(path, e))?;

        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path)?;
        fs::read(&full).map_err(|e| map_io(path, e))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.full_path(path)?.is_file())
    }

    fn size(&self, path: &str) -> Result<u64> {
        let full = self.full_path(path)?;
        let meta = fs::metadata(&full).map_err(|e| map_io(path, e))?;
        Ok(meta.len())
    }

    fn list(&self, prefix: &str) -> Result<PathIter<'_>> {
        // start from the deepest directory the prefix fully names
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.full_path(dir_part)?
        };

        Ok(Box::new(DirWalk {
            root: self.root.clone(),
            prefix: prefix.to_string(),
            stack: if start.is_dir() { vec![start] } else { Vec::new() },
            pending: Vec::new(),
        }))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(path, e)),
        }
    }

    fn supports_rename(&self) -> bool {
        true
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let src = self.full_path(from)?;
        let dst = self.full_path(to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| map_io(to, e))?;
        }
        fs::rename(&src, &dst).map_err(|e| map_io(from, e))?;

        // make the rename itself durable
        if let Some(parent) = dst.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

/// Depth-first directory walk, one directory read at a time
struct DirWalk {
    root: PathBuf,
    prefix: String,
    stack: Vec<PathBuf>,
    pending: Vec<Result<String>>,
}

impl DirWalk {
    fn key_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn read_next_dir(&mut self) -> bool {
        let Some(dir) = self.stack.pop() else {
            return false;
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.pending
                    .push(Err(map_io(&dir.to_string_lossy(), e)));
                return true;
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    self.pending.push(Err(map_io(&dir.to_string_lossy(), e)));
                    continue;
                }
            };
            let path = entry.path();
            if path.is_dir() {
                self.stack.push(path);
            } else if let Some(key) = self.key_of(&path) {
                if key.starts_with(&self.prefix) {
                    files.push(key);
                }
            }
        }

        // pending is popped from the back
        files.sort_unstable_by(|a, b| b.cmp(a));
        self.pending.extend(files.into_iter().map(Ok));
        true
    }
}

impl Iterator for DirWalk {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.pop() {
                return Some(item);
            }
            if !self.read_next_dir() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (LocalStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        (LocalStorage::new(dir.path().join("root")).unwrap(), dir)
    }

    #[test]
    fn test_put_get_exists() {
        let (store, _dir) = storage();
        store.put("team/name/v0.0.1/model", b"weights").unwrap();

        assert!(store.exists("team/name/v0.0.1/model").unwrap());
        assert!(!store.exists("team/name/v0.0.2/model").unwrap());
        assert_eq!(store.get("team/name/v0.0.1/model").unwrap(), b"weights");
        assert_eq!(store.size("team/name/v0.0.1/model").unwrap(), 7);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (store, _dir) = storage();
        assert!(matches!(
            store.get("nope/x"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_prefix() {
        let (store, _dir) = storage();
        store.put("a/x/v0.0.1/model", b"1").unwrap();
        store.put("a/x/v0.0.2/model", b"2").unwrap();
        store.put("a/y/v0.0.1/model", b"3").unwrap();
        store.put("b/x/v0.0.1/model", b"4").unwrap();

        let mut listed: Vec<String> = store.list("a/x/").unwrap().map(|p| p.unwrap()).collect();
        listed.sort();
        assert_eq!(listed, vec!["a/x/v0.0.1/model", "a/x/v0.0.2/model"]);

        let all: Vec<String> = store.list("").unwrap().map(|p| p.unwrap()).collect();
        assert_eq!(all.len(), 4);

        // partial segment prefixes match too
        let partial: Vec<String> = store.list("a/").unwrap().map(|p| p.unwrap()).collect();
        assert_eq!(partial.len(), 3);

        assert_eq!(store.list("missing/").unwrap().count(), 0);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _dir) = storage();
        store.put("t/n/v1.0.0/tabular", b"rows").unwrap();
        store.delete("t/n/v1.0.0/tabular").unwrap();
        store.delete("t/n/v1.0.0/tabular").unwrap();
        assert!(!store.exists("t/n/v1.0.0/tabular").unwrap());
    }

    #[test]
    fn test_rename_moves_content() {
        let (store, _dir) = storage();
        store.put("t/n/v1.0.0/model.staging-1", b"blob").unwrap();
        store.rename("t/n/v1.0.0/model.staging-1", "t/n/v1.0.0/model").unwrap();

        assert!(!store.exists("t/n/v1.0.0/model.staging-1").unwrap());
        assert_eq!(store.get("t/n/v1.0.0/model").unwrap(), b"blob");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (store, _dir) = storage();
        assert!(store.put("../outside", b"x").is_err());
        assert!(store.get("/etc/passwd").is_err());
    }
}
