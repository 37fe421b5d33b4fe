use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::articles::{SeenCache, StoreLimits};
use crate::clock::Clock;
use crate::domain::{Article, ArticleUpdate};
use crate::store::ReadStateStore;

/// Connects the store to the persisted read state of whichever session is
/// current.
#[derive(Clone)]
pub struct ReadStateBridge {
    store: ReadStateStore,
    session: watch::Receiver<Option<String>>,
}

impl ReadStateBridge {
    pub fn new(store: ReadStateStore, session: watch::Receiver<Option<String>>) -> Self {
        Self { store, session }
    }

    fn session_id(&self) -> Option<String> {
        self.session.borrow().clone()
    }
}

/// The live feed: priority-ordered, capacity-bounded, idempotent on id.
pub struct ArticleStore {
    articles: Vec<Article>,
    seen_cache: SeenCache,
    max_articles: usize,
    clock: Arc<dyn Clock>,
    read_state: Option<ReadStateBridge>,
}

impl ArticleStore {
    pub fn new(limits: StoreLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            articles: Vec::new(),
            seen_cache: SeenCache::new(limits.seen_cache_max, limits.seen_cache_ttl),
            max_articles: limits.max_articles,
            clock,
            read_state: None,
        }
    }

    pub fn with_read_state(mut self, bridge: ReadStateBridge) -> Self {
        self.read_state = Some(bridge);
        self
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Article> {
        self.articles.iter().find(|a| a.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// True if the article is live or was already shown and trimmed.
    pub fn contains_or_seen(&self, id: &str) -> bool {
        self.contains(id) || self.seen_cache.contains(id)
    }

    pub fn seen_cache(&self) -> &SeenCache {
        &self.seen_cache
    }

    /// Articles in display order as of now. Priority windows that expired
    /// since the last mutation are taken into account.
    pub fn snapshot(&self) -> Vec<Article> {
        let mut articles = self.articles.clone();
        sort_for_display(&mut articles, self.clock.now());
        articles
    }

    /// Insert one article. No-op if the id is already live.
    pub fn add(&mut self, mut article: Article) -> bool {
        if self.contains(&article.id) {
            return false;
        }
        if self.previously_read(&article.id) {
            article.seen = true;
        }
        self.articles.push(article);
        self.settle();
        true
    }

    /// Merge a fetched or pushed batch. Articles already live or in the seen
    /// cache are skipped, and so is anything a full store would trim right
    /// away. Returns the number inserted.
    pub fn merge(&mut self, mut batch: Vec<Article>) -> usize {
        batch.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let now = self.clock.now();
        let mut incoming = HashSet::new();
        let mut inserted = 0;
        let mut skipped = 0;
        for mut article in batch {
            if self.contains_or_seen(&article.id) || !incoming.insert(article.id.clone()) {
                continue;
            }
            if self.below_floor(&article, now) {
                self.seen_cache.record(&article.id, now, article.timestamp);
                skipped += 1;
                continue;
            }
            if self.previously_read(&article.id) {
                article.seen = true;
            }
            self.articles.push(article);
            inserted += 1;
        }

        if skipped > 0 {
            debug!(count = skipped, "Skipped articles older than a full store");
        }
        if inserted > 0 || skipped > 0 {
            self.settle();
        }
        inserted
    }

    /// A full store would trim a non-priority article published before
    /// every live one.
    fn below_floor(&self, article: &Article, now: DateTime<Utc>) -> bool {
        if self.articles.len() < self.max_articles || article.is_prioritized(now) {
            return false;
        }
        self.articles
            .iter()
            .map(|a| a.timestamp)
            .min()
            .is_some_and(|oldest| article.timestamp < oldest)
    }

    pub fn update(&mut self, id: &str, update: &ArticleUpdate) -> bool {
        let now = self.clock.now();
        let Some(article) = self.articles.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        if update.apply(article) {
            let published = article.timestamp;
            self.persist_seen(id, now, published);
        }
        self.settle();
        true
    }

    /// Mark an article as read. Returns true if it was unread before.
    pub fn mark_seen(&mut self, id: &str) -> bool {
        let now = self.clock.now();
        let Some(article) = self.articles.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        if article.seen {
            return false;
        }
        article.seen = true;
        let published = article.timestamp;
        self.persist_seen(id, now, published);
        true
    }

    pub fn clear(&mut self) {
        self.articles.clear();
        self.seen_cache.clear();
    }

    fn persist_seen(&mut self, id: &str, now: DateTime<Utc>, published: DateTime<Utc>) {
        self.seen_cache.record(id, now, published);
        let Some(ref bridge) = self.read_state else {
            return;
        };
        if let Some(session_id) = bridge.session_id() {
            if let Err(e) = bridge.store.mark_read(&session_id, id) {
                warn!(article_id = id, error = %e, "Failed to persist read state");
            }
        }
    }

    fn previously_read(&self, id: &str) -> bool {
        self.read_state
            .as_ref()
            .and_then(|bridge| bridge.session_id().map(|sid| bridge.store.contains(&sid, id)))
            .unwrap_or(false)
    }

    /// Re-sort, then trim past capacity. Trimmed articles go to the seen
    /// cache so later fetches don't bring them back.
    fn settle(&mut self) {
        let now = self.clock.now();
        sort_for_display(&mut self.articles, now);

        if self.articles.len() > self.max_articles {
            let trimmed = self.articles.split_off(self.max_articles);
            for article in &trimmed {
                self.seen_cache.record(&article.id, now, article.timestamp);
            }
            debug!(count = trimmed.len(), "Trimmed articles past capacity");
        }
        self.seen_cache.prune(now);
    }
}

/// Prioritized first (sponsored, then statistics), then newest arrival,
/// then newest publication.
pub fn sort_for_display(articles: &mut [Article], now: DateTime<Utc>) {
    articles.sort_by(|a, b| {
        a.priority_tier(now)
            .cmp(&b.priority_tier(now))
            .then_with(|| b.received_at.cmp(&a.received_at))
            .then_with(|| b.timestamp.cmp(&a.timestamp))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::Category;
    use crate::store::ClientStorage;
    use chrono::Duration;

    fn limits(max_articles: usize) -> StoreLimits {
        StoreLimits {
            max_articles,
            seen_cache_max: 50,
            seen_cache_ttl: Duration::hours(24),
        }
    }

    fn store_with_clock(max_articles: usize) -> (ArticleStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = ArticleStore::new(limits(max_articles), clock.clone());
        (store, clock)
    }

    fn article_at(id: &str, received_at: DateTime<Utc>) -> Article {
        let mut article = Article::new(id, received_at);
        article.received_at = received_at;
        article
    }

    fn ids(store: &ArticleStore) -> Vec<String> {
        store.snapshot().into_iter().map(|a| a.id).collect()
    }

    #[test]
    fn test_add_is_idempotent() {
        let (mut store, clock) = store_with_clock(10);
        let article = article_at("a", clock.now());
        assert!(store.add(article.clone()));
        assert!(!store.add(article));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_merge_skips_existing_and_duplicates() {
        let (mut store, clock) = store_with_clock(10);
        let now = clock.now();
        store.add(article_at("a", now));

        let batch = vec![
            article_at("a", now),
            article_at("b", now),
            article_at("b", now),
        ];
        assert_eq!(store.merge(batch), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_newest_arrival_first() {
        let (mut store, clock) = store_with_clock(10);
        let now = clock.now();
        store.add(article_at("old", now - Duration::minutes(5)));
        store.add(article_at("new", now));
        assert_eq!(ids(&store), vec!["new", "old"]);
    }

    #[test]
    fn test_priority_ordering() {
        let (mut store, clock) = store_with_clock(10);
        let now = clock.now();
        let until = now + Duration::hours(1);

        let mut stats = article_at("stats", now - Duration::minutes(3));
        stats.category = Category::Statistics;
        stats.priority_until = Some(until);

        let mut sponsored = article_at("sponsored", now - Duration::minutes(10));
        sponsored.category = Category::Sponsored;
        sponsored.priority_until = Some(until);

        let mut expired = article_at("expired", now - Duration::minutes(1));
        expired.category = Category::Sponsored;
        expired.priority_until = Some(now - Duration::seconds(1));

        store.merge(vec![
            article_at("fresh", now),
            stats,
            expired,
            sponsored,
        ]);

        assert_eq!(ids(&store), vec!["sponsored", "stats", "fresh", "expired"]);
    }

    #[test]
    fn test_priority_window_expiry_reorders_snapshot() {
        let (mut store, clock) = store_with_clock(10);
        let now = clock.now();

        let mut sponsored = article_at("sponsored", now - Duration::minutes(10));
        sponsored.category = Category::Sponsored;
        sponsored.priority_until = Some(now + Duration::minutes(5));
        store.add(sponsored);
        store.add(article_at("regular", now));
        assert_eq!(ids(&store), vec!["sponsored", "regular"]);

        clock.advance(Duration::minutes(6));
        assert_eq!(ids(&store), vec!["regular", "sponsored"]);
    }

    #[test]
    fn test_within_tier_uses_received_at_not_timestamp() {
        let (mut store, clock) = store_with_clock(10);
        let now = clock.now();

        // Published long ago but just arrived
        let mut late = Article::new("late", now - Duration::days(2));
        late.received_at = now;
        let mut early = Article::new("early", now);
        early.received_at = now - Duration::minutes(1);

        store.merge(vec![early, late]);
        assert_eq!(ids(&store), vec!["late", "early"]);
    }

    #[test]
    fn test_capacity_trim_moves_to_seen_cache() {
        let (mut store, clock) = store_with_clock(3);
        let now = clock.now();
        for i in 0..5 {
            store.add(article_at(&format!("a{}", i), now + Duration::seconds(i)));
            assert!(store.len() <= 3);
        }

        assert_eq!(ids(&store), vec!["a4", "a3", "a2"]);
        assert!(store.seen_cache().contains("a0"));
        assert!(store.seen_cache().contains("a1"));
        assert!(store.contains_or_seen("a0"));

        // Trimmed articles are not resurrected by a later merge
        assert_eq!(store.merge(vec![article_at("a0", now)]), 0);
    }

    #[test]
    fn test_full_store_skips_older_articles_past_cache_size() {
        let clock = Arc::new(ManualClock::default());
        let limits = StoreLimits {
            max_articles: 3,
            seen_cache_max: 5,
            seen_cache_ttl: Duration::hours(24),
        };
        let mut store = ArticleStore::new(limits, clock.clone());
        let now = clock.now();
        let server: Vec<Article> = (0..20)
            .map(|i| article_at(&format!("a{:02}", i), now - Duration::minutes(i)))
            .collect();

        assert_eq!(store.merge(server.clone()), 3);
        assert_eq!(ids(&store), vec!["a00", "a01", "a02"]);
        assert!(store.seen_cache().len() <= 5);

        // Refetches arrive with a later received_at but must not displace
        // the newest articles
        for _ in 0..3 {
            clock.advance(Duration::seconds(30));
            let refetched: Vec<Article> = server
                .iter()
                .cloned()
                .map(|mut a| {
                    a.received_at = clock.now();
                    a
                })
                .collect();
            assert_eq!(store.merge(refetched), 0);
            assert_eq!(ids(&store), vec!["a00", "a01", "a02"]);
        }

        // A genuinely newer article still gets in
        assert_eq!(store.merge(vec![article_at("fresh", clock.now())]), 1);
        assert_eq!(ids(&store)[0], "fresh");
    }

    #[test]
    fn test_full_store_admits_old_prioritized_article() {
        let (mut store, clock) = store_with_clock(2);
        let now = clock.now();
        store.merge(vec![article_at("a", now), article_at("b", now)]);

        let mut sponsored = article_at("sponsored", now - Duration::hours(5));
        sponsored.category = Category::Sponsored;
        sponsored.priority_until = Some(now + Duration::hours(1));
        assert_eq!(store.merge(vec![sponsored]), 1);
        assert_eq!(ids(&store)[0], "sponsored");
    }

    #[test]
    fn test_mark_seen_writes_through() {
        let clock = Arc::new(ManualClock::default());
        let storage = ClientStorage::in_memory();
        let read_state = ReadStateStore::new(storage);
        let (_tx, rx) = watch::channel(Some("session_1".to_string()));
        let mut store = ArticleStore::new(limits(10), clock.clone())
            .with_read_state(ReadStateBridge::new(read_state.clone(), rx));

        store.add(article_at("a", clock.now()));
        assert!(store.mark_seen("a"));
        assert!(!store.mark_seen("a"));
        assert!(!store.mark_seen("missing"));

        assert!(store.get("a").unwrap().seen);
        assert!(read_state.contains("session_1", "a"));
        assert!(store.seen_cache().contains("a"));
    }

    #[test]
    fn test_add_restores_seen_from_read_state() {
        let clock = Arc::new(ManualClock::default());
        let read_state = ReadStateStore::new(ClientStorage::in_memory());
        read_state.mark_read("session_1", "a").unwrap();
        let (_tx, rx) = watch::channel(Some("session_1".to_string()));
        let mut store = ArticleStore::new(limits(10), clock.clone())
            .with_read_state(ReadStateBridge::new(read_state, rx));

        store.add(article_at("a", clock.now()));
        store.merge(vec![article_at("b", clock.now())]);

        assert!(store.get("a").unwrap().seen);
        assert!(!store.get("b").unwrap().seen);
    }

    #[test]
    fn test_read_state_follows_session_changes() {
        let clock = Arc::new(ManualClock::default());
        let read_state = ReadStateStore::new(ClientStorage::in_memory());
        let (tx, rx) = watch::channel(Some("s1".to_string()));
        let mut store = ArticleStore::new(limits(10), clock.clone())
            .with_read_state(ReadStateBridge::new(read_state.clone(), rx));

        tx.send_replace(Some("s2".to_string()));
        store.add(article_at("a", clock.now()));
        store.mark_seen("a");

        assert!(read_state.contains("s2", "a"));
        assert!(!read_state.contains("s1", "a"));
    }

    #[test]
    fn test_update_applies_partial() {
        let (mut store, clock) = store_with_clock(10);
        store.add(article_at("a", clock.now()));

        let update = ArticleUpdate {
            title: Some("Edited".into()),
            ..Default::default()
        };
        assert!(store.update("a", &update));
        assert!(!store.update("missing", &update));
        assert_eq!(store.get("a").unwrap().display_title(), "Edited");
    }

    #[test]
    fn test_clear_empties_store_and_cache() {
        let (mut store, clock) = store_with_clock(1);
        store.add(article_at("a", clock.now()));
        store.add(article_at("b", clock.now() + Duration::seconds(1)));
        assert!(!store.seen_cache().is_empty());

        store.clear();
        assert!(store.is_empty());
        assert!(store.seen_cache().is_empty());
    }
}
