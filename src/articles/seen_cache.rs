use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy)]
struct SeenEntry {
    seen_at: DateTime<Utc>,
    published: DateTime<Utc>,
}

/// Ids of articles that have already been shown, with the time they were
/// last seen. Keeps trimmed articles from coming back on the next fetch.
#[derive(Debug, Clone)]
pub struct SeenCache {
    entries: HashMap<String, SeenEntry>,
    max_size: usize,
    ttl: Duration,
}

impl SeenCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_size,
            ttl,
        }
    }

    /// Remember `id`, published at `published`, as seen at `at`.
    pub fn record(&mut self, id: &str, at: DateTime<Utc>, published: DateTime<Utc>) {
        self.entries
            .entry(id.to_string())
            .and_modify(|entry| entry.seen_at = entry.seen_at.max(at))
            .or_insert(SeenEntry {
                seen_at: at,
                published,
            });
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Drop expired entries, then the oldest ones until the cache fits.
    /// Entries seen at the same time go oldest publication first.
    /// Returns how many entries were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.seen_at <= ttl);

        if self.entries.len() > self.max_size {
            let mut by_age: Vec<(String, SeenEntry)> = self.entries.drain().collect();
            by_age.sort_by(|a, b| {
                b.1.seen_at
                    .cmp(&a.1.seen_at)
                    .then_with(|| b.1.published.cmp(&a.1.published))
                    .then_with(|| a.0.cmp(&b.0))
            });
            by_age.truncate(self.max_size);
            self.entries = by_age.into_iter().collect();
        }

        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_latest_time() {
        let now = Utc::now();
        let mut cache = SeenCache::new(10, Duration::hours(1));
        cache.record("a", now, now);
        cache.record("a", now - Duration::minutes(5), now);
        assert_eq!(cache.len(), 1);

        // Still inside the TTL measured from the later sighting
        assert_eq!(cache.prune(now + Duration::minutes(58)), 0);
        assert!(cache.contains("a"));
    }

    #[test]
    fn test_prune_drops_expired() {
        let now = Utc::now();
        let mut cache = SeenCache::new(10, Duration::hours(1));
        cache.record("old", now - Duration::hours(2), now - Duration::hours(3));
        cache.record("fresh", now - Duration::minutes(10), now - Duration::hours(3));

        assert_eq!(cache.prune(now), 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("fresh"));
    }

    #[test]
    fn test_prune_enforces_size_keeping_newest() {
        let now = Utc::now();
        let mut cache = SeenCache::new(3, Duration::hours(24));
        for i in 0..5 {
            cache.record(&format!("id-{}", i), now - Duration::minutes(10 - i), now);
        }

        assert_eq!(cache.prune(now), 2);
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("id-0"));
        assert!(!cache.contains("id-1"));
        assert!(cache.contains("id-4"));
    }

    #[test]
    fn test_prune_ties_drop_oldest_publication() {
        let now = Utc::now();
        let mut cache = SeenCache::new(5, Duration::hours(24));
        for i in 0..20 {
            cache.record(&format!("id-{:02}", i), now, now - Duration::minutes(i));
        }

        assert_eq!(cache.prune(now), 15);
        for i in 0..5 {
            assert!(cache.contains(&format!("id-{:02}", i)));
        }
        for i in 5..20 {
            assert!(!cache.contains(&format!("id-{:02}", i)));
        }
    }
}
