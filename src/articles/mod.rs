mod seen_cache;
mod store;

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration;

pub use seen_cache::SeenCache;
pub use store::{sort_for_display, ArticleStore, ReadStateBridge};

use crate::config::FeedConfig;

#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub max_articles: usize,
    pub seen_cache_max: usize,
    pub seen_cache_ttl: Duration,
}

impl From<&FeedConfig> for StoreLimits {
    fn from(config: &FeedConfig) -> Self {
        Self {
            max_articles: config.max_articles_in_memory,
            seen_cache_max: config.seen_cache_max,
            seen_cache_ttl: config.seen_cache_ttl(),
        }
    }
}

/// Article store shared between the sync task and readers.
#[derive(Clone)]
pub struct SharedArticles {
    inner: Arc<Mutex<ArticleStore>>,
}

impl SharedArticles {
    pub fn new(store: ArticleStore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Lock the store. Critical sections never span an await.
    pub fn lock(&self) -> MutexGuard<'_, ArticleStore> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
