//! Blob storage adapters
//!
//! The core sees persistence as a key → byte-blob interface. Writes must be
//! atomic; the file-backed adapter writes to a temp file and renames it into
//! place.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::errors::{PersistError, Result};

/// Key the identity cache blob is stored under
pub const IDENTITY_CACHE_KEY: &str = "identity_cache";

/// Key the local static Noise key is stored under
pub const STATIC_KEY_KEY: &str = "static_key";

// ----------------------------------------------------------------------------
// Blob Store Trait
// ----------------------------------------------------------------------------

/// Minimal persistent key-value interface the core depends on.
pub trait BlobStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn store(&mut self, key: &str, data: &[u8]) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Memory Store
// ----------------------------------------------------------------------------

/// In-memory store for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    data: BTreeMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn store(&mut self, key: &str, data: &[u8]) -> Result<()> {
        self.data.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// File Store
// ----------------------------------------------------------------------------

/// One file per key inside a directory, with write-temp-then-rename so a
/// crash mid-write never leaves a torn blob.
#[derive(Debug)]
pub struct FileBlobStore {
    directory: PathBuf,
}

impl FileBlobStore {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(PersistError::Io)?;
        Ok(Self { directory })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PersistError::Io(err).into()),
        }
    }

    fn store(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let final_path = self.path_for(key);
        let temp_path = self.directory.join(format!("{key}.tmp"));
        std::fs::write(&temp_path, data).map_err(PersistError::Io)?;
        std::fs::rename(&temp_path, &final_path).map_err(PersistError::Io)?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PersistError::Io(err).into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryBlobStore::new();
        assert!(store.load("missing").unwrap().is_none());

        store.store("key", b"value").unwrap();
        assert_eq!(store.load("key").unwrap().unwrap(), b"value");

        store.remove("key").unwrap();
        assert!(store.load("key").unwrap().is_none());
    }

    #[test]
    fn test_file_store_round_trip() {
        let directory = std::env::temp_dir().join(format!(
            "bitmesh-store-test-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let mut store = FileBlobStore::new(&directory).unwrap();

        store.store(IDENTITY_CACHE_KEY, b"blob").unwrap();
        assert_eq!(store.load(IDENTITY_CACHE_KEY).unwrap().unwrap(), b"blob");

        // Overwrite goes through the temp file and leaves no droppings.
        store.store(IDENTITY_CACHE_KEY, b"blob2").unwrap();
        assert_eq!(store.load(IDENTITY_CACHE_KEY).unwrap().unwrap(), b"blob2");
        assert!(!directory.join("identity_cache.tmp").exists());

        store.remove(IDENTITY_CACHE_KEY).unwrap();
        assert!(store.load(IDENTITY_CACHE_KEY).unwrap().is_none());
        // Removing a missing key is not an error.
        store.remove(IDENTITY_CACHE_KEY).unwrap();

        std::fs::remove_dir_all(&directory).ok();
    }
}
