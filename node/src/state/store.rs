use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::SessionState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("state updates must be JSON objects")]
    NotAnObject,
}

/// JSON-object store with merge-on-write semantics.
///
/// Clones share one lock, so every read-merge-write across the process is
/// serialized through a single owner.
#[derive(Clone)]
pub struct StateStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current persisted mapping. Missing or corrupt files read as empty.
    pub fn read(&self) -> Map<String, Value> {
        let _guard = self.lock.lock();
        self.load()
    }

    pub fn snapshot(&self) -> SessionState {
        SessionState::from_map(&self.read())
    }

    /// `current ∪ partial`, partial's keys winning, written back whole.
    pub fn merge(&self, partial: Value) -> Result<(), StoreError> {
        self.update(|_| partial).map(|_| ())
    }

    /// Like [`merge`](Self::merge), but the partial is derived from the current
    /// mapping inside the same critical section.
    pub fn update<F>(&self, derive: F) -> Result<Map<String, Value>, StoreError>
    where
        F: FnOnce(&Map<String, Value>) -> Value,
    {
        let _guard = self.lock.lock();
        let mut current = self.load();

        let Value::Object(partial) = derive(&current) else {
            return Err(StoreError::NotAnObject);
        };
        for (key, value) in partial {
            current.insert(key, value);
        }

        self.persist(&current)?;
        Ok(current)
    }

    /// Remove the backing file. A store that was never written is not an error.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn load(&self) -> Map<String, Value> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                warn!("Cannot read {}: {} (starting from empty state)", self.path.display(), e);
                return Map::new();
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                warn!("{} does not hold a JSON object ({}), ignoring it", self.path.display(), other);
                Map::new()
            }
            Err(e) => {
                warn!("Corrupt state file {}: {} (starting from empty state)", self.path.display(), e);
                Map::new()
            }
        }
    }

    fn persist(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string(map)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!("State persisted to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> StateStore {
        StateStore::open(dir.path().join("state.json"))
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.read().is_empty());
        assert_eq!(store.snapshot(), SessionState::default());
    }

    #[test]
    fn test_corrupt_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.read().is_empty());

        fs::write(store.path(), "[1, 2, 3]").unwrap();
        assert!(store.read().is_empty());
    }

    #[test]
    fn test_merge_preserves_untouched_keys() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.merge(json!({ "a": 1, "b": 2 })).unwrap();
        store.merge(json!({ "b": 3 })).unwrap();
        assert_eq!(Value::Object(store.read()), json!({ "a": 1, "b": 3 }));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.merge(json!({ "a": 1 })).unwrap();
        let once = store.read();
        store.merge(json!({ "a": 1 })).unwrap();
        assert_eq!(store.read(), once);
    }

    #[test]
    fn test_merge_over_corrupt_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "garbage").unwrap();
        store.merge(json!({ "userId": "u-1" })).unwrap();
        assert_eq!(Value::Object(store.read()), json!({ "userId": "u-1" }));
    }

    #[test]
    fn test_merge_rejects_non_objects() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(matches!(store.merge(json!(42)), Err(StoreError::NotAnObject)));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_update_sees_current_mapping() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.merge(json!({ "count": 1 })).unwrap();
        let merged = store
            .update(|current| {
                let next = current["count"].as_i64().unwrap() + 1;
                json!({ "count": next })
            })
            .unwrap();
        assert_eq!(merged["count"], json!(2));
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("nested/deeper/state.json"));
        store.merge(json!({ "a": true })).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.merge(json!({ "userId": "u-1", "pointsTotal": 5 })).unwrap();
        store.clear().unwrap();
        assert!(store.read().is_empty());
        store.clear().unwrap();
    }

    #[test]
    fn test_concurrent_merges_keep_every_key() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.merge(json!({ format!("k{}", i): i })).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.read().len(), 8);
    }
}
