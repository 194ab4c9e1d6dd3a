use ibkr_bridge_core::{Fingerprint, ToolResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct MemoryEntry {
    result: ToolResult,
    expires_at: Instant,
    /// Recency stamp; larger is more recent.
    last_used: u64,
}

/// Bounded in-memory tier with least-recently-used eviction.
pub struct MemoryCache {
    capacity: usize,
    entries: HashMap<Fingerprint, MemoryEntry>,
    clock: u64,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Unexpired entry for `key`; expired entries are dropped on sight.
    pub fn get(&mut self, key: &Fingerprint, now: Instant) -> Option<ToolResult> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(key)?;
        if entry.expires_at > now {
            entry.last_used = stamp;
            return Some(entry.result.clone());
        }
        self.entries.remove(key);
        None
    }

    /// Store `result` until `now + ttl`. A full cache first sheds expired
    /// entries, then the least recently used.
    pub fn put(&mut self, key: Fingerprint, result: ToolResult, now: Instant, ttl: Duration) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let purged = self.purge_expired(now);
            if purged > 0 {
                debug!(purged, "Purged expired cache entries");
            }
        }
        let last_used = self.tick();
        self.entries.insert(
            key,
            MemoryEntry {
                result,
                expires_at: now + ttl,
                last_used,
            },
        );
        while self.entries.len() > self.capacity {
            self.evict_one();
        }
    }

    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
