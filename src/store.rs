use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, warn};

/// How long a mutated key sits in cache before its file is rewritten.
const WRITE_DEBOUNCE: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Process-wide JSON document store.
///
/// Every key maps to one `<key>.json` file under the data directory. Reads
/// are served from an in-memory cache; writes update the cache immediately
/// and schedule a debounced background flush, so hot paths never block on
/// disk. The cache is last-writer-wins and the flush always persists the
/// value that is current at flush time.
pub struct JsonStore {
    dir: PathBuf,
    cache: DashMap<String, Value>,
    pending: DashMap<String, JoinHandle<()>>,
}

impl JsonStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Arc::new(JsonStore {
            dir,
            cache: DashMap::new(),
            pending: DashMap::new(),
        }))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// True when the key is cached or already has a file on disk.
    pub fn exists(&self, key: &str) -> bool {
        self.cache.contains_key(key) || self.path_for(key).exists()
    }

    /// Read a document, falling back to `T::default()` when the file is
    /// missing or unreadable. A corrupt file is reported and replaced by the
    /// default rather than taking the process down.
    pub fn get<T>(&self, key: &str) -> T
    where
        T: DeserializeOwned + Serialize + Default,
    {
        if let Some(value) = self.cache.get(key) {
            return serde_json::from_value(value.value().clone()).unwrap_or_else(|e| {
                warn!("Cached value for `{key}` has unexpected shape: {e}");
                T::default()
            });
        }

        let path = self.path_for(key);
        let value = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!("Corrupt store file {}: {e}; using default", path.display());
                    default_value::<T>()
                }
            },
            // Missing file is the normal first-run case.
            Err(_) => default_value::<T>(),
        };

        let typed = serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            warn!("Store file {} has unexpected shape: {e}; using default", path.display());
            T::default()
        });
        self.cache.insert(key.to_string(), value);
        typed
    }

    /// Update a document in cache and schedule a background write.
    pub fn set<T: Serialize>(self: &Arc<Self>, key: &str, value: &T) {
        let json = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                error!("Could not serialize value for `{key}`: {e}");
                return;
            }
        };
        self.cache.insert(key.to_string(), json);
        self.schedule_write(key);
    }

    fn schedule_write(self: &Arc<Self>, key: &str) {
        // One pending flush per key is enough: it reads the cache when it
        // fires, so later set() calls are picked up by the same flush.
        if self.pending.contains_key(key) {
            return;
        }
        let me = self.clone();
        let key = key.to_string();
        let handle = tokio::spawn({
            let key = key.clone();
            async move {
                sleep(WRITE_DEBOUNCE).await;
                me.pending.remove(&key);
                me.write_to_file(&key).await;
            }
        });
        self.pending.insert(key, handle);
    }

    async fn write_to_file(&self, key: &str) {
        let Some(value) = self.cache.get(key).map(|v| v.value().clone()) else {
            return;
        };
        let path = self.path_for(key);
        match serde_json::to_string_pretty(&value) {
            Ok(raw) => {
                if let Err(e) = tokio::fs::write(&path, raw).await {
                    error!("Error writing store file {}: {e}", path.display());
                }
            }
            Err(e) => error!("Error serializing store key `{key}`: {e}"),
        }
    }

    /// Force a pending write for `key` to land now.
    pub async fn flush(&self, key: &str) {
        if let Some((_, handle)) = self.pending.remove(key) {
            handle.abort();
        }
        self.write_to_file(key).await;
    }

    /// Flush every cached key. Used on shutdown.
    pub async fn flush_all(&self) {
        let keys: Vec<String> = self.cache.iter().map(|kv| kv.key().clone()).collect();
        for key in keys {
            self.flush(&key).await;
        }
    }

    /// Drop all of a profile's documents: evict them from the cache, cancel
    /// their pending writes, and remove their files, including files that
    /// were never read this run.
    pub fn purge_profile(&self, profile_id: &str) {
        let suffix = format!("_{profile_id}");
        let keys: Vec<String> = self
            .cache
            .iter()
            .map(|kv| kv.key().clone())
            .filter(|k| k.ends_with(&suffix))
            .collect();
        for key in keys {
            self.cache.remove(&key);
            if let Some((_, handle)) = self.pending.remove(&key) {
                handle.abort();
            }
        }

        let file_suffix = format!("{suffix}.json");
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(&file_suffix) {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        warn!("Could not remove {name}: {e}");
                    }
                }
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn default_value<T: Serialize + Default>() -> Value {
    serde_json::to_value(T::default()).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        count: u32,
        label: String,
    }

    #[tokio::test]
    async fn set_then_get_hits_cache() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        let doc = Doc { count: 3, label: "hello".into() };
        store.set("doc", &doc);
        assert_eq!(store.get::<Doc>("doc"), doc);
    }

    #[tokio::test]
    async fn debounced_write_lands_on_disk() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        store.set("doc", &Doc { count: 1, label: "a".into() });
        // Overwrite before the debounce fires; only the latest value should land.
        store.set("doc", &Doc { count: 2, label: "b".into() });

        sleep(WRITE_DEBOUNCE + Duration::from_millis(300)).await;

        let raw = fs::read_to_string(dir.path().join("doc.json")).unwrap();
        let on_disk: Doc = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk, Doc { count: 2, label: "b".into() });
    }

    #[tokio::test]
    async fn flush_forces_the_write() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        store.set("doc", &Doc { count: 9, label: "now".into() });
        store.flush("doc").await;

        let raw = fs::read_to_string(dir.path().join("doc.json")).unwrap();
        let on_disk: Doc = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk.count, 9);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("doc.json"), "{not json").unwrap();

        let store = JsonStore::open(dir.path()).unwrap();
        assert_eq!(store.get::<Doc>("doc"), Doc::default());
    }

    #[tokio::test]
    async fn reload_after_restart_round_trips() {
        let dir = tempdir().unwrap();
        {
            let store = JsonStore::open(dir.path()).unwrap();
            store.set("doc", &Doc { count: 7, label: "persisted".into() });
            store.flush("doc").await;
        }
        // Fresh store instance simulates a process restart.
        let store = JsonStore::open(dir.path()).unwrap();
        let doc: Doc = store.get("doc");
        assert_eq!(doc.count, 7);
        assert_eq!(doc.label, "persisted");
    }

    #[tokio::test]
    async fn purge_profile_clears_cache_and_files() {
        let dir = tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();

        let mut contacts = HashMap::new();
        contacts.insert("c1".to_string(), "Ada".to_string());
        store.set("contacts_p1", &contacts);
        store.set("contacts_p2", &contacts);
        store.flush("contacts_p1").await;
        store.flush("contacts_p2").await;

        store.purge_profile("p1");

        assert!(!dir.path().join("contacts_p1.json").exists());
        assert!(dir.path().join("contacts_p2.json").exists());
        assert!(store.get::<HashMap<String, String>>("contacts_p1").is_empty());
    }
}
