//! Last-known-good load configuration
//!
//! After every successful model load the (context length, GPU layers) pair is
//! written to a key-value store, so the next cold start can try it first
//! instead of walking the whole fallback cascade again.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::storage::{get_data_dir, write_json, StorageError};

pub const LAST_WORKING_CTX_KEY: &str = "last_working_ctx";
pub const LAST_WORKING_GPU_LAYERS_KEY: &str = "last_working_gpu_layers";

/// Minimal integer key-value store
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Option<i64>;
    fn set(&mut self, key: &str, value: i64) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

/// Process-local store, useful for tests and ephemeral sessions
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: HashMap<String, i64>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: i64) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.values.remove(key);
        Ok(())
    }
}

/// Store backed by a JSON object on disk. Every write is flushed immediately.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: BTreeMap<String, i64>,
}

impl JsonFileStore {
    /// Opens the store at `path`. A missing file yields an empty store; a
    /// corrupt one is logged and replaced on the next write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let json = fs::read_to_string(&path)?;
            match serde_json::from_str(&json) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!("Ignoring corrupt store {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, values })
    }

    /// Opens `known_good.json` in the application data directory
    pub fn open_default() -> Result<Self, StorageError> {
        Self::open(get_data_dir()?.join("known_good.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<i64> {
        self.values.get(key).copied()
    }

    fn set(&mut self, key: &str, value: i64) -> Result<(), StorageError> {
        self.values.insert(key.to_string(), value);
        write_json(&self.path, &self.values)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        if self.values.remove(key).is_some() {
            write_json(&self.path, &self.values)?;
        }
        Ok(())
    }
}

/// A (context length, GPU-offload layers) pair that loaded successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub context_length: u32,
    pub gpu_layers: u32,
}

impl LoadConfig {
    /// Reads the saved pair. Both keys must be present and in range.
    pub fn read(store: &dyn KeyValueStore) -> Option<Self> {
        let context_length = store.get(LAST_WORKING_CTX_KEY)?;
        let gpu_layers = store.get(LAST_WORKING_GPU_LAYERS_KEY)?;
        match (u32::try_from(context_length), u32::try_from(gpu_layers)) {
            (Ok(context_length), Ok(gpu_layers)) if context_length > 0 => Some(Self {
                context_length,
                gpu_layers,
            }),
            _ => {
                tracing::warn!(
                    "Ignoring out-of-range saved config: n_ctx={}, n_gpu_layers={}",
                    context_length,
                    gpu_layers
                );
                None
            }
        }
    }

    pub fn write(&self, store: &mut dyn KeyValueStore) -> Result<(), StorageError> {
        store.set(LAST_WORKING_GPU_LAYERS_KEY, i64::from(self.gpu_layers))?;
        store.set(LAST_WORKING_CTX_KEY, i64::from(self.context_length))?;
        tracing::debug!(
            "Saved working config: n_ctx={}, n_gpu_layers={}",
            self.context_length,
            self.gpu_layers
        );
        Ok(())
    }

    /// Removes any saved pair
    pub fn forget(store: &mut dyn KeyValueStore) -> Result<(), StorageError> {
        store.remove(LAST_WORKING_GPU_LAYERS_KEY)?;
        store.remove(LAST_WORKING_CTX_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_read_as_none() {
        let mut store = MemoryStore::default();
        assert_eq!(LoadConfig::read(&store), None);

        store.set(LAST_WORKING_CTX_KEY, 1024).unwrap();
        assert_eq!(LoadConfig::read(&store), None);
    }

    #[test]
    fn test_write_then_read() {
        let mut store = MemoryStore::default();
        let config = LoadConfig {
            context_length: 1024,
            gpu_layers: 64,
        };
        config.write(&mut store).unwrap();
        assert_eq!(LoadConfig::read(&store), Some(config));

        LoadConfig::forget(&mut store).unwrap();
        assert_eq!(LoadConfig::read(&store), None);
    }

    #[test]
    fn test_out_of_range_values_are_ignored() {
        let mut store = MemoryStore::default();
        store.set(LAST_WORKING_CTX_KEY, 2048).unwrap();
        store.set(LAST_WORKING_GPU_LAYERS_KEY, -5).unwrap();
        assert_eq!(LoadConfig::read(&store), None);
    }

    #[test]
    fn test_json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_good.json");

        let mut store = JsonFileStore::open(&path).unwrap();
        LoadConfig {
            context_length: 512,
            gpu_layers: 16,
        }
        .write(&mut store)
        .unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            LoadConfig::read(&reopened),
            Some(LoadConfig {
                context_length: 512,
                gpu_layers: 16
            })
        );
    }

    #[test]
    fn test_json_store_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_good.json");
        fs::write(&path, "{not json").unwrap();

        let mut store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.get(LAST_WORKING_CTX_KEY), None);
        store.set(LAST_WORKING_CTX_KEY, 1).unwrap();
        assert_eq!(JsonFileStore::open(&path).unwrap().get(LAST_WORKING_CTX_KEY), Some(1));
    }
}
