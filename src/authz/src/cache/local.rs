//! Bounded in-process cache tier with TTL and a stale grace window

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Cached entry with its own TTL
#[derive(Clone)]
struct CachedEntry<V> {
    value: V,
    cached_at: Instant,
    ttl: Duration,
}

impl<V> CachedEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            ttl,
        }
    }

    /// Past its TTL extended by `grace`
    fn is_expired(&self, grace: Duration) -> bool {
        self.cached_at.elapsed() >= self.ttl + grace
    }
}

/// Result of a lookup that also considers expired entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Fresh(V),
    /// Expired but still within the stale grace window
    Stale(V),
    Missing,
}

/// Local cache tier
///
/// - `get` only returns entries younger than `ttl` (or their own, shorter deadline)
/// - expired entries are kept for `stale_grace` so a failed reload can fall back
/// - at capacity the oldest tenth of the entries is evicted
pub struct LocalTier<V> {
    entries: DashMap<String, CachedEntry<V>>,
    capacity: usize,
    ttl: Duration,
    stale_grace: Duration,
    stats: DashMap<&'static str, usize>,
}

impl<V: Clone> LocalTier<V> {
    pub fn new(capacity: usize, ttl: Duration, stale_grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
            stale_grace,
            stats: DashMap::new(),
        }
    }

    /// Fresh value only
    pub fn get(&self, key: &str) -> Option<V> {
        match self.lookup(key) {
            Lookup::Fresh(value) => {
                self.increment_stat("hits");
                Some(value)
            }
            Lookup::Stale(_) | Lookup::Missing => {
                self.increment_stat("misses");
                None
            }
        }
    }

    /// Fresh or stale value, dropping entries past the grace window
    pub fn lookup(&self, key: &str) -> Lookup<V> {
        let Some(entry) = self.entries.get(key) else {
            return Lookup::Missing;
        };

        if !entry.is_expired(Duration::ZERO) {
            return Lookup::Fresh(entry.value.clone());
        }

        if !entry.is_expired(self.stale_grace) {
            return Lookup::Stale(entry.value.clone());
        }

        drop(entry);
        self.entries
            .remove_if(key, |_, e| e.is_expired(self.stale_grace));
        self.increment_stat("expirations");
        Lookup::Missing
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_with_ttl(key.into(), value, self.ttl);
    }

    /// Insert an entry that stops being fresh at `deadline` if that comes before
    /// the tier TTL
    pub fn insert_until(&self, key: impl Into<String>, value: V, deadline: Instant) {
        let ttl = deadline.saturating_duration_since(Instant::now()).min(self.ttl);
        self.insert_with_ttl(key.into(), value, ttl);
    }

    fn insert_with_ttl(&self, key: String, value: V, ttl: Duration) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(key, CachedEntry::new(value, ttl));
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stats(&self) -> LocalTierStats {
        LocalTierStats {
            hits: self.get_stat("hits"),
            misses: self.get_stat("misses"),
            expirations: self.get_stat("expirations"),
            evictions: self.get_stat("evictions"),
            entries: self.entries.len(),
            max_entries: self.capacity,
        }
    }

    /// Drop entries past the grace window, then the oldest tenth if still full
    fn evict_oldest(&self) {
        let grace = self.stale_grace;
        self.entries.retain(|_, entry| !entry.is_expired(grace));
        if self.entries.len() < self.capacity {
            return;
        }

        let mut ages: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().cached_at))
            .collect();
        ages.sort_by_key(|(_, cached_at)| *cached_at);

        let to_remove = (self.capacity / 10).max(1);
        for (key, _) in ages.into_iter().take(to_remove) {
            if self.entries.remove(&key).is_some() {
                self.increment_stat("evictions");
            }
        }
    }

    fn increment_stat(&self, key: &'static str) {
        self.stats
            .entry(key)
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    fn get_stat(&self, key: &str) -> usize {
        self.stats.get(key).map(|v| *v).unwrap_or(0)
    }
}

/// Local tier statistics
#[derive(Debug, Clone)]
pub struct LocalTierStats {
    pub hits: usize,
    pub misses: usize,
    pub expirations: usize,
    pub evictions: usize,
    pub entries: usize,
    pub max_entries: usize,
}

impl LocalTierStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get() {
        let tier = LocalTier::new(10, Duration::from_secs(60), Duration::ZERO);
        tier.insert("u1", 1);

        assert_eq!(tier.get("u1"), Some(1));
        assert_eq!(tier.get("u2"), None);

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_ttl_and_stale_window() {
        let tier = LocalTier::new(10, Duration::from_millis(50), Duration::from_millis(100));
        tier.insert("u1", "perms");

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(tier.get("u1"), None);
        assert_eq!(tier.lookup("u1"), Lookup::Stale("perms"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tier.lookup("u1"), Lookup::Missing);
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_insert_until_caps_freshness() {
        let tier = LocalTier::new(10, Duration::from_secs(60), Duration::from_secs(60));
        tier.insert_until("u1", 1, Instant::now() + Duration::from_millis(40));
        tier.insert_until("u2", 2, Instant::now() + Duration::from_secs(600));

        assert_eq!(tier.get("u1"), Some(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tier.get("u1"), None);
        assert_eq!(tier.lookup("u1"), Lookup::Stale(1));
        assert_eq!(tier.get("u2"), Some(2), "Tier TTL still applies to later deadlines");
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let tier = LocalTier::new(10, Duration::from_secs(60), Duration::ZERO);
        for i in 0..10 {
            tier.insert(format!("u{}", i), i);
            std::thread::sleep(Duration::from_millis(1));
        }
        tier.insert("u10", 10);

        assert_eq!(tier.len(), 10);
        assert_eq!(tier.get("u0"), None);
        assert_eq!(tier.get("u10"), Some(10));
        assert_eq!(tier.stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_at_capacity_does_not_evict() {
        let tier = LocalTier::new(2, Duration::from_secs(60), Duration::ZERO);
        tier.insert("a", 1);
        tier.insert("b", 2);
        tier.insert("a", 3);

        assert_eq!(tier.len(), 2);
        assert_eq!(tier.get("a"), Some(3));
        assert_eq!(tier.get("b"), Some(2));
    }

    #[test]
    fn test_remove() {
        let tier = LocalTier::new(10, Duration::from_secs(60), Duration::from_secs(60));
        tier.insert("u1", 1);

        assert!(tier.remove("u1"));
        assert!(!tier.remove("u1"));
        assert_eq!(tier.lookup("u1"), Lookup::Missing);
    }
}
