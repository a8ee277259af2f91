//! Content-addressed cache of transformer outputs.
//!
//! A cache key ties a step's output to the exact input table, the step's
//! name and the step's declared configuration. Cache faults never fail a
//! run: unreadable entries are misses and failed writes are logged.

use crate::fingerprint::{combine, config_fingerprint};
use crate::persistence::{atomic_write_json, is_temp_file, load_json};
use crate::table::Table;
use crate::transform::Transformer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Default time-to-live for cache entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub input_fingerprint: String,
    pub step_name: String,
    pub config_fingerprint: String,
}

impl CacheKey {
    pub fn for_step(input: &Table, step: &dyn Transformer) -> Self {
        Self {
            input_fingerprint: input.fingerprint(),
            step_name: step.name().to_string(),
            config_fingerprint: config_fingerprint(&step.config()),
        }
    }

    /// Single hex digest identifying this key; used as the entry file name.
    pub fn digest(&self) -> String {
        combine(&[
            &self.input_fingerprint,
            &self.step_name,
            &self.config_fingerprint,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub table: Table,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, table: Table, ttl: Duration) -> Self {
        Self {
            key,
            table,
            created_at: Utc::now(),
            ttl_secs: ttl_secs(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() >= i64::try_from(self.ttl_secs).unwrap_or(i64::MAX)
    }
}

/// Whole seconds of `ttl`; a non-zero TTL below one second counts as one.
fn ttl_secs(ttl: Duration) -> u64 {
    if ttl.subsec_nanos() > 0 {
        ttl.as_secs().saturating_add(1)
    } else {
        ttl.as_secs()
    }
}

/// Store of step outputs. Implementations must treat every fault as a miss.
pub trait Cache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<Table>;

    fn set(&self, key: &CacheKey, table: &Table, ttl: Duration);
}

// ---------------------------------------------------------------------------
// FileCache
// ---------------------------------------------------------------------------

/// Directory of `<digest>.json` entries, safe to share between processes.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

/// Summary of a cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub expired: usize,
    pub unreadable: usize,
    pub total_bytes: u64,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.digest()))
    }

    fn entry_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") && !is_temp_file(&path) {
                files.push(path);
            }
        }
        Ok(files)
    }

    pub fn stats(&self) -> std::io::Result<CacheStats> {
        let mut stats = CacheStats::default();
        let now = Utc::now();
        for path in self.entry_files()? {
            stats.entries += 1;
            stats.total_bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match load_json::<CacheEntry>(&path) {
                Ok(Some(entry)) if entry.is_expired_at(now) => stats.expired += 1,
                Ok(Some(_)) => {}
                _ => stats.unreadable += 1,
            }
        }
        Ok(stats)
    }

    /// Delete expired and unreadable entries. Returns how many were removed.
    pub fn prune_expired(&self) -> std::io::Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for path in self.entry_files()? {
            let stale = match load_json::<CacheEntry>(&path) {
                Ok(Some(entry)) => entry.is_expired_at(now),
                Ok(None) => false,
                Err(_) => true,
            };
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        debug!(dir = %self.dir.display(), removed, "Pruned cache");
        Ok(removed)
    }

    /// Delete every entry. Returns how many were removed.
    pub fn clear(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl Cache for FileCache {
    fn get(&self, key: &CacheKey) -> Option<Table> {
        let path = self.entry_path(key);
        let entry = match load_json::<CacheEntry>(&path) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                return None;
            }
        };
        if entry.key != *key {
            warn!(path = %path.display(), "Cache entry key mismatch");
            return None;
        }
        if entry.is_expired() {
            debug!(step = %key.step_name, "Cache entry expired");
            return None;
        }
        Some(entry.table)
    }

    fn set(&self, key: &CacheKey, table: &Table, ttl: Duration) {
        let path = self.entry_path(key);
        let entry = CacheEntry::new(key.clone(), table.clone(), ttl);
        if let Err(e) = atomic_write_json(&path, &entry) {
            warn!(path = %path.display(), error = %e, "Failed to write cache entry");
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryCache
// ---------------------------------------------------------------------------

/// Process-local cache, mostly useful in tests and one-shot runs.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Cache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Table> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.table.clone())
    }

    fn set(&self, key: &CacheKey, table: &Table, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.clone(), CacheEntry::new(key.clone(), table.clone(), ttl));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::CleaningTransformer;
    use serde_json::json;
    use tempfile::TempDir;

    fn table() -> Table {
        Table::new(vec!["goals".into()], vec![vec![json!(1)], vec![json!(2)]]).unwrap()
    }

    fn key() -> CacheKey {
        let step = CleaningTransformer::new("clean").fill("goals", json!(0));
        CacheKey::for_step(&table(), &step)
    }

    #[test]
    fn test_key_depends_on_config() {
        let a = CleaningTransformer::new("clean").fill("goals", json!(0));
        let b = CleaningTransformer::new("clean").fill("goals", json!(1));
        assert_ne!(
            CacheKey::for_step(&table(), &a).digest(),
            CacheKey::for_step(&table(), &b).digest()
        );
    }

    #[test]
    fn test_file_cache_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        assert!(cache.get(&key()).is_none());
        cache.set(&key(), &table(), DEFAULT_TTL);
        assert_eq!(cache.get(&key()), Some(table()));
    }

    #[test]
    fn test_file_cache_expired_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        cache.set(&key(), &table(), Duration::ZERO);
        assert!(cache.get(&key()).is_none());
        assert_eq!(cache.stats().unwrap().expired, 1);
        assert_eq!(cache.prune_expired().unwrap(), 1);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_entry_ttl_bounds() {
        let short = CacheEntry::new(key(), table(), Duration::from_millis(200));
        assert_eq!(short.ttl_secs, 1);
        assert!(!short.is_expired_at(short.created_at));

        let mut forever = CacheEntry::new(key(), table(), DEFAULT_TTL);
        forever.ttl_secs = u64::MAX;
        assert!(!forever.is_expired_at(forever.created_at + chrono::Duration::days(365 * 100)));
    }

    #[test]
    fn test_file_cache_corrupt_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path());
        let path = dir.path().join(format!("{}.json", key().digest()));
        std::fs::write(&path, b"{\"key\":").unwrap();
        assert!(cache.get(&key()).is_none());

        cache.set(&key(), &table(), DEFAULT_TTL);
        assert_eq!(cache.get(&key()), Some(table()));
    }

    #[test]
    fn test_file_cache_write_failure_is_ignored() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let cache = FileCache::new(&blocker);
        cache.set(&key(), &table(), DEFAULT_TTL);
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn test_file_cache_clear() {
        let dir = TempDir::new().unwrap();
        let cache = FileCache::new(dir.path().join("cache"));
        assert_eq!(cache.clear().unwrap(), 0);
        cache.set(&key(), &table(), DEFAULT_TTL);
        assert_eq!(cache.stats().unwrap().entries, 1);
        assert_eq!(cache.clear().unwrap(), 1);
    }

    #[test]
    fn test_in_memory_cache() {
        let cache = InMemoryCache::new();
        cache.set(&key(), &table(), DEFAULT_TTL);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key()), Some(table()));
        cache.set(&key(), &table(), Duration::ZERO);
        assert!(cache.get(&key()).is_none());
    }
}
