pub mod disk;
pub mod memory;
pub mod ttl;

use chrono::Utc;
use ibkr_bridge_core::{CacheClass, CacheConfig, Fingerprint, ToolResult};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use disk::{DiskCache, DiskEntry, DiskStats};
pub use memory::MemoryCache;
pub use ttl::TtlPolicy;

/// Failures inside the cache. Callers log these and fall through.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    Poisoned,
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt cache file {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Cache file {} belongs to another key", .path.display())]
    Mismatch { path: PathBuf },
    #[error("Failed to encode cache entry: {0}")]
    Serialize(serde_json::Error),
}

/// Two-tier response cache keyed by request fingerprint.
///
/// The memory tier is a bounded LRU. When a directory is configured, results
/// of persistent tool kinds are also written to disk and survive restarts.
/// No method returns an error: failures are logged and treated as misses.
pub struct ResponseCache {
    memory: Mutex<MemoryCache>,
    disk: Option<DiskCache>,
    ttl: TtlPolicy,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            memory: Mutex::new(MemoryCache::new(config.capacity)),
            disk: config.dir.clone().map(DiskCache::new),
            ttl: TtlPolicy::from(config),
        }
    }

    /// Memory-only cache, mostly for tests.
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(&CacheConfig {
            capacity,
            dir: None,
            ..Default::default()
        })
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    pub fn disk(&self) -> Option<&DiskCache> {
        self.disk.as_ref()
    }

    fn memory(&self) -> Result<MutexGuard<'_, MemoryCache>, CacheError> {
        self.memory.lock().map_err(|_| CacheError::Poisoned)
    }

    /// Unexpired result for `key`, consulting memory then disk.
    pub async fn get(&self, key: &Fingerprint) -> Option<ToolResult> {
        match self.memory() {
            Ok(mut memory) => {
                if let Some(result) = memory.get(key, Instant::now()) {
                    debug!(fingerprint = %key, "Memory cache hit");
                    return Some(result);
                }
            }
            Err(e) => {
                warn!("Cache read skipped: {}", e);
                return None;
            }
        }

        let disk = self.disk.as_ref()?;
        let now = Utc::now();
        match disk.get(key, now).await {
            Ok(Some(entry)) => {
                debug!(fingerprint = %key, "Disk cache hit");
                let remaining = (entry.expires_at - now).to_std().unwrap_or_default();
                self.promote(key, &entry.result, remaining);
                Some(entry.result)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(fingerprint = %key, "Disk cache read failed: {}", e);
                None
            }
        }
    }

    fn promote(&self, key: &Fingerprint, result: &ToolResult, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        match self.memory() {
            Ok(mut memory) => memory.put(key.clone(), result.clone(), Instant::now(), ttl),
            Err(e) => warn!("Cache promote skipped: {}", e),
        }
    }

    /// Store `result` for `ttl`. A zero TTL stores nothing.
    pub async fn put(&self, key: &Fingerprint, result: &ToolResult, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        match self.memory() {
            Ok(mut memory) => memory.put(key.clone(), result.clone(), Instant::now(), ttl),
            Err(e) => warn!("Cache write skipped: {}", e),
        }

        let Some(disk) = &self.disk else {
            return;
        };
        if result.tool.cache_class() != CacheClass::Persistent {
            return;
        }
        let stored_at = Utc::now();
        let expires_at = match chrono::Duration::from_std(ttl) {
            Ok(ttl) => stored_at + ttl,
            Err(_) => return,
        };
        let entry = DiskEntry {
            fingerprint: key.clone(),
            stored_at,
            expires_at,
            result: result.clone(),
        };
        if let Err(e) = disk.put(&entry).await {
            warn!(fingerprint = %key, "Disk cache write failed: {}", e);
        }
    }

    /// Number of live memory entries.
    pub fn len(&self) -> usize {
        self.memory().map(|memory| memory.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibkr_bridge_core::ToolKind;
    use serde_json::json;

    fn result(tool: ToolKind) -> ToolResult {
        ToolResult::new(tool, Utc::now(), json!({"value": 1}))
    }

    fn key(name: &str) -> Fingerprint {
        Fingerprint(name.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ResponseCache::in_memory(8);
        let stored = result(ToolKind::Positions);
        cache.put(&key("p"), &stored, Duration::from_secs(15)).await;

        tokio::time::advance(Duration::from_secs(14)).await;
        assert_eq!(cache.get(&key("p")).await, Some(stored));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&key("p")).await, None);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_stored() {
        let cache = ResponseCache::in_memory(8);
        cache
            .put(&key("s"), &result(ToolKind::Snapshot), Duration::ZERO)
            .await;
        assert!(cache.is_empty());
        assert_eq!(cache.get(&key("s")).await, None);
    }

    #[tokio::test]
    async fn test_disk_tier_survives_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let stored = result(ToolKind::MarketData);
        ResponseCache::new(&config)
            .put(&key("m"), &stored, Duration::from_secs(3600))
            .await;

        let fresh = ResponseCache::new(&config);
        assert!(fresh.is_empty());
        assert_eq!(fresh.get(&key("m")).await, Some(stored));
        // Promoted into memory
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn test_volatile_kinds_stay_off_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(&CacheConfig {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        cache
            .put(&key("acct"), &result(ToolKind::AccountSummary), Duration::from_secs(15))
            .await;
        assert_eq!(cache.disk().unwrap().stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_unwritable_disk_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the cache directory should be
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"").unwrap();
        let cache = ResponseCache::new(&CacheConfig {
            dir: Some(blocker),
            ..Default::default()
        });
        let stored = result(ToolKind::ContractLookup);
        cache.put(&key("c"), &stored, Duration::from_secs(60)).await;

        // Memory tier still serves the result
        assert_eq!(cache.get(&key("c")).await, Some(stored));
    }
}
