//! Per-URL cache of probe results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Entry limit when none is configured.
pub const DEFAULT_MAX_CACHE_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    requires_auth: bool,
    stored_at: Instant,
}

/// Counters reported by [`ProbeCache::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCacheStats {
    pub entries: usize,
    /// Entries younger than the TTL.
    pub live_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

/// TTL cache holding at most `max_entries` verdicts.
///
/// A full cache first drops expired entries, then the oldest one.
pub struct ProbeCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProbeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            max_entries: DEFAULT_MAX_CACHE_ENTRIES,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached result for `url`. Entries at or past the TTL are dropped.
    pub async fn get(&self, url: &str) -> Option<bool> {
        let mut entries = self.entries.lock().await;
        let result = match entries.get(url) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.requires_auth),
            Some(_) => {
                entries.remove(url);
                None
            }
            None => None,
        };

        let counter = if result.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    pub async fn set(&self, url: &str, requires_auth: bool) {
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(url) && entries.len() >= self.max_entries {
            let ttl = self.ttl;
            entries.retain(|_, e| e.stored_at.elapsed() < ttl);

            if entries.len() >= self.max_entries
                && let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(url, _)| url.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            url.to_string(),
            CacheEntry {
                requires_auth,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every entry; returns how many there were.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        count
    }

    pub async fn stats(&self) -> ProbeCacheStats {
        let entries = self.entries.lock().await;
        let live_entries = entries
            .values()
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .count();

        ProbeCacheStats {
            entries: entries.len(),
            live_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl_seconds: self.ttl.as_secs(),
            max_entries: self.max_entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set() {
        let cache = ProbeCache::new(Duration::from_secs(300));
        assert_eq!(cache.get("https://a.example").await, None);

        cache.set("https://a.example", true).await;
        cache.set("https://b.example", false).await;
        assert_eq!(cache.get("https://a.example").await, Some(true));
        assert_eq!(cache.get("https://b.example").await, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = ProbeCache::new(Duration::from_secs(300));
        cache.set("https://a.example", true).await;

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("https://a.example").await, Some(true));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("https://a.example").await, None);
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_stats_count_hits_and_misses() {
        let cache = ProbeCache::new(Duration::from_secs(60));
        cache.get("https://a.example").await;
        cache.set("https://a.example", true).await;
        cache.get("https://a.example").await;
        cache.get("https://a.example").await;

        let stats = cache.stats().await;
        assert_eq!(
            stats,
            ProbeCacheStats {
                entries: 1,
                live_entries: 1,
                hits: 2,
                misses: 1,
                ttl_seconds: 60,
                max_entries: DEFAULT_MAX_CACHE_ENTRIES,
            }
        );
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = ProbeCache::new(Duration::from_secs(60));
        cache.set("https://a.example", true).await;
        cache.set("https://b.example", true).await;

        assert_eq!(cache.clear().await, 2);
        assert_eq!(cache.get("https://b.example").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_drops_expired_entries_first() {
        let cache = ProbeCache::new(Duration::from_secs(60)).with_max_entries(3);
        cache.set("https://old-1.example", true).await;
        cache.set("https://old-2.example", true).await;

        tokio::time::advance(Duration::from_secs(59)).await;
        cache.set("https://fresh.example", false).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        cache.set("https://new.example", true).await;

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.live_entries, 2);
        assert_eq!(cache.get("https://fresh.example").await, Some(false));
        assert_eq!(cache.get("https://new.example").await, Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cache_evicts_oldest_live_entry() {
        let cache = ProbeCache::new(Duration::from_secs(300)).with_max_entries(2);
        cache.set("https://a.example", true).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("https://b.example", true).await;
        tokio::time::advance(Duration::from_secs(1)).await;

        cache.set("https://a.example", false).await;
        assert_eq!(cache.stats().await.entries, 2);

        cache.set("https://c.example", true).await;
        assert_eq!(cache.stats().await.entries, 2);
        assert_eq!(cache.get("https://b.example").await, None);
        assert_eq!(cache.get("https://a.example").await, Some(false));
        assert_eq!(cache.get("https://c.example").await, Some(true));
    }

    #[tokio::test]
    async fn test_many_distinct_urls_stay_bounded() {
        let cache = ProbeCache::new(Duration::from_secs(300)).with_max_entries(10);
        for i in 0..100 {
            cache.set(&format!("https://host-{}.example", i), true).await;
        }
        assert_eq!(cache.stats().await.entries, 10);
    }
}
