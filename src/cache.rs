use std::collections::HashMap;
use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::prelude::*;
use std::path::Path;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub trait Cache {
    fn save(&self, key: &str, value: &str) -> Result<(), Box<dyn Error>>;
    fn load(&self, key: &str) -> Result<String, Box<dyn Error>>;
}

#[derive(Clone, Debug, Default)]
pub struct FileSystemCache {
    file_path: String,
}

impl FileSystemCache {
    pub fn new(file_path: &str) -> FileSystemCache {
        let path = Path::new(file_path);
        if !path.exists() {
            fs::create_dir_all(path).unwrap();
        }

        FileSystemCache {
            file_path: file_path.to_string(),
        }
    }
}

impl Cache for FileSystemCache {
    fn save(&self, key: &str, value: &str) -> Result<(), Box<dyn Error>> {
        // write `value` to file `key`, create a new file if it doesn't exist
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(self.file_path.clone() + "/" + key)?;
        file.write_all(value.as_bytes())?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<String, Box<dyn Error>> {
        if !Path::exists(Path::new((self.file_path.clone() + "/" + key).as_str())) {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Key not found",
            )));
        }

        let mut file = File::open(self.file_path.clone() + "/" + key)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents)
    }
}

/// In-memory TTL cache shared between threads. `get` never evicts (eviction
/// would need a write lock); [`SafeCache::clean_expired`] is the only
/// evictor. TTL is per cache, not per entry.
#[derive(Debug)]
pub struct SafeCache<V> {
    entries: RwLock<HashMap<String, (V, Instant)>>,
    ttl: Duration,
}

impl<V: Clone> SafeCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let expiry = Instant::now() + self.ttl;
        self.entries
            .write()
            .unwrap()
            .insert(key.into(), (value, expiry));
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some((value, expiry)) if Instant::now() < *expiry => Some(value.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.write().unwrap().remove(key).map(|(v, _)| v)
    }

    pub fn clean_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, (_, expiry)| now < *expiry);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_after_expiry_returns_none_without_evicting() {
        let cache: SafeCache<u64> = SafeCache::new(Duration::from_millis(10));
        cache.insert("a", 1);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("a"), None);
        // still physically present until clean_expired runs
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.clean_expired(), 1);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn live_entries_survive_cleaning() {
        let cache: SafeCache<String> = SafeCache::new(Duration::from_secs(60));
        cache.insert("k", "v".to_string());
        assert_eq!(cache.clean_expired(), 0);
        assert_eq!(cache.get("k").unwrap(), "v");
    }

    #[test]
    fn filesystem_cache_roundtrip() {
        let dir = std::env::temp_dir().join("txshield_cache_test");
        let cache = FileSystemCache::new(dir.to_str().unwrap());
        cache.save("abi_1_deadbeef", "[]").unwrap();
        assert_eq!(cache.load("abi_1_deadbeef").unwrap(), "[]");
        assert!(cache.load("missing").is_err());
    }
}
