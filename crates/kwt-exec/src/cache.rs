use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

struct CacheEntry {
    exists: bool,
    checked_at: Instant,
}

/// Short-TTL answer cache for "does pod X in namespace Y exist", shared by
/// every concurrent session.
///
/// Both positive and negative results are stored; an entry older than the
/// TTL is treated as absent. Lost-update races between concurrent lookups
/// are harmless since both racers store a freshly observed result. Existence
/// can legitimately change between check and use, so bounded staleness is
/// part of the contract.
pub struct PodExistenceCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl PodExistenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached answer, or `None` when no fresh entry is held.
    pub fn lookup(&self, namespace: &str, pod: &str) -> Option<bool> {
        let entries = self.entries.lock().unwrap_or_else(|e| {
            warn!("pod cache lock was poisoned, recovering");
            e.into_inner()
        });
        let entry = entries.get(&(namespace.to_string(), pod.to_string()))?;
        if entry.checked_at.elapsed() > self.ttl {
            debug!(namespace, pod, "pod cache entry expired");
            return None;
        }
        Some(entry.exists)
    }

    /// Store a freshly observed result, replacing any previous entry.
    pub fn insert(&self, namespace: &str, pod: &str, exists: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| {
            warn!("pod cache lock was poisoned, recovering");
            e.into_inner()
        });
        entries.insert(
            (namespace.to_string(), pod.to_string()),
            CacheEntry {
                exists,
                checked_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_on_empty_cache() {
        let cache = PodExistenceCache::new(Duration::from_secs(300));
        assert_eq!(cache.lookup("default", "web-0"), None);
    }

    #[test]
    fn hit_within_ttl_for_both_polarities() {
        let cache = PodExistenceCache::new(Duration::from_secs(300));
        cache.insert("default", "web-0", true);
        cache.insert("default", "gone-1", false);
        assert_eq!(cache.lookup("default", "web-0"), Some(true));
        assert_eq!(cache.lookup("default", "gone-1"), Some(false));
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let cache = PodExistenceCache::new(Duration::from_millis(20));
        cache.insert("default", "web-0", true);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.lookup("default", "web-0"), None);
    }

    #[test]
    fn stale_value_is_served_until_expiry() {
        // The pod may be deleted after the check; within the TTL the cached
        // value keeps being returned unchanged.
        let cache = PodExistenceCache::new(Duration::from_secs(300));
        cache.insert("default", "web-0", true);
        assert_eq!(cache.lookup("default", "web-0"), Some(true));
        assert_eq!(cache.lookup("default", "web-0"), Some(true));
    }

    #[test]
    fn insert_replaces_previous_entry() {
        let cache = PodExistenceCache::new(Duration::from_secs(300));
        cache.insert("default", "web-0", false);
        cache.insert("default", "web-0", true);
        assert_eq!(cache.lookup("default", "web-0"), Some(true));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn namespaces_are_distinct_keys() {
        let cache = PodExistenceCache::new(Duration::from_secs(300));
        cache.insert("team-a", "web-0", true);
        assert_eq!(cache.lookup("team-b", "web-0"), None);
    }
}
