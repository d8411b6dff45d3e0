//! Key/value preference storage backing private certificates, the public
//! certificate expiration index and scheduler state.
//!
//! Backends:
//! - [`InMemoryPreferenceStore`] for tests and ephemeral sessions.
//! - [`FilePreferenceStore`] persisting the whole map as one JSON document,
//!   written atomically (temp file + rename).

use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::{CertificateError, Result};

pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

fn lock_poisoned(what: &str) -> CertificateError {
    CertificateError::Storage(format!("{what} lock poisoned"))
}

#[derive(Default)]
pub struct InMemoryPreferenceStore {
    values: RwLock<Map<String, Value>>,
}

impl InMemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for InMemoryPreferenceStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .write()
            .map_err(|_| lock_poisoned("preferences"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .write()
            .map_err(|_| lock_poisoned("preferences"))?
            .remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FilePreferenceStoreConfig {
    pub base_dir: PathBuf,
    pub file_name: String,
}

impl FilePreferenceStoreConfig {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            file_name: "sharing_preferences.json".to_string(),
        }
    }

    fn path(&self) -> PathBuf {
        self.base_dir.join(&self.file_name)
    }
}

pub struct FilePreferenceStore {
    config: FilePreferenceStoreConfig,
    values: RwLock<Map<String, Value>>,
}

impl FilePreferenceStore {
    /// Open the store, loading any previously saved document.
    pub fn open(config: FilePreferenceStoreConfig) -> Result<Self> {
        let path = config.path();
        let values = if path.exists() {
            let bytes = fs::read(&path)?;
            match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => map,
                _ => {
                    return Err(CertificateError::StorageCorrupted(format!(
                        "preference file {} is not a JSON object",
                        path.display()
                    )))
                }
            }
        } else {
            Map::new()
        };
        Ok(Self {
            config,
            values: RwLock::new(values),
        })
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(values)?;
        let path = self.config.path();
        let tmp_path = self
            .config
            .base_dir
            .join(format!("{}.tmp", self.config.file_name));
        fs::create_dir_all(&self.config.base_dir)?;
        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&bytes)?;
            f.flush()?;
            f.sync_all()?;
        }
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut values = self.values.write().map_err(|_| lock_poisoned("preferences"))?;
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.write().map_err(|_| lock_poisoned("preferences"))?;
        if values.remove(key).is_some() {
            self.persist(&values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn in_memory_store_sets_and_removes() {
        let store = InMemoryPreferenceStore::new();
        assert!(store.get("k").is_none());
        store.set("k", json!({"a": 1})).unwrap();
        assert_eq!(store.get("k"), Some(json!({"a": 1})));
        store.remove("k").unwrap();
        assert!(store.get("k").is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = FilePreferenceStoreConfig::new(dir.path().to_path_buf());

        let store = FilePreferenceStore::open(config.clone()).unwrap();
        store.set("scheduler", json!({"failures": 2})).unwrap();
        store.set("gone", json!(true)).unwrap();
        store.remove("gone").unwrap();
        drop(store);

        let reopened = FilePreferenceStore::open(config).unwrap();
        assert_eq!(reopened.get("scheduler"), Some(json!({"failures": 2})));
        assert!(reopened.get("gone").is_none());
    }

    #[test]
    fn file_store_rejects_non_object_document() {
        let dir = tempfile::tempdir().unwrap();
        let config = FilePreferenceStoreConfig::new(dir.path().to_path_buf());
        fs::write(dir.path().join(&config.file_name), b"[1,2,3]").unwrap();
        assert!(matches!(
            FilePreferenceStore::open(config),
            Err(CertificateError::StorageCorrupted(_))
        ));
    }
}
