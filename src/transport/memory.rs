use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::app::{Result, WirefeedError};
use crate::domain::{NewSessionRecord, RawArticle, RecordFilter, SessionRecord, SessionRecordUpdate};
use crate::transport::{PushEvent, Subscription, Transport};

const PUSH_BUFFER: usize = 256;

/// In-process backend. Push delivery and every call class can be made to
/// fail, which is how the fallback paths are exercised.
pub struct MemoryTransport {
    inner: Mutex<Inner>,
}

struct Inner {
    articles: Vec<RawArticle>,
    subscribers: Vec<mpsc::Sender<PushEvent>>,
    records: Vec<SessionRecord>,
    next_record: u64,
    push_enabled: bool,
    fail_fetch: bool,
    fail_subscribe: bool,
    fail_records: bool,
    fail_queries: bool,
    fetch_count: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                articles: Vec::new(),
                subscribers: Vec::new(),
                records: Vec::new(),
                next_record: 1,
                push_enabled: true,
                fail_fetch: false,
                fail_subscribe: false,
                fail_records: false,
                fail_queries: false,
                fetch_count: 0,
            }),
        }
    }

    pub fn with_articles(articles: Vec<RawArticle>) -> Self {
        let transport = Self::new();
        transport.inner().articles = articles;
        transport
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an article server-side and push it to live subscribers, unless
    /// push delivery is disabled.
    pub fn publish(&self, article: RawArticle) {
        let mut inner = self.inner();
        inner.articles.push(article.clone());
        if inner.push_enabled {
            inner.subscribers.retain(|tx| !tx.is_closed());
            for tx in &inner.subscribers {
                let _ = tx.try_send(PushEvent::Article(article.clone()));
            }
        }
    }

    /// Add an article server-side without pushing it anywhere.
    pub fn insert_silently(&self, article: RawArticle) {
        self.inner().articles.push(article);
    }

    /// Simulate a push channel that silently stops delivering.
    pub fn set_push_enabled(&self, enabled: bool) {
        self.inner().push_enabled = enabled;
    }

    /// Deliver an error to every live subscriber.
    pub fn fail_subscriptions(&self, message: &str) {
        let mut inner = self.inner();
        inner.subscribers.retain(|tx| !tx.is_closed());
        for tx in &inner.subscribers {
            let _ = tx.try_send(PushEvent::Error(message.to_string()));
        }
    }

    pub fn set_fetch_failure(&self, fail: bool) {
        self.inner().fail_fetch = fail;
    }

    pub fn set_subscribe_failure(&self, fail: bool) {
        self.inner().fail_subscribe = fail;
    }

    pub fn set_record_failure(&self, fail: bool) {
        self.inner().fail_records = fail;
    }

    /// Fail record lookups only; creates and updates still go through.
    pub fn set_query_failure(&self, fail: bool) {
        self.inner().fail_queries = fail;
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    pub fn fetch_count(&self) -> usize {
        self.inner().fetch_count
    }

    pub fn insert_record(&self, record: SessionRecord) {
        self.inner().records.push(record);
    }

    pub fn record(&self, id: &str) -> Option<SessionRecord> {
        self.inner().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.inner().records.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn fetch_all(&self) -> Result<Vec<RawArticle>> {
        let mut inner = self.inner();
        if inner.fail_fetch {
            return Err(WirefeedError::Transport("fetch failed".to_string()));
        }
        inner.fetch_count += 1;
        Ok(inner.articles.clone())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let mut inner = self.inner();
        if inner.fail_subscribe {
            return Err(WirefeedError::Transport("subscribe failed".to_string()));
        }
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        inner.subscribers.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn create_record(&self, record: &NewSessionRecord) -> Result<SessionRecord> {
        let mut inner = self.inner();
        if inner.fail_records {
            return Err(WirefeedError::Transport("record store unavailable".to_string()));
        }
        let created = SessionRecord {
            id: format!("rec-{}", inner.next_record),
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            start_time: record.start_time,
            is_active: record.is_active,
            duration_secs: None,
            end_reason: None,
        };
        inner.next_record += 1;
        inner.records.push(created.clone());
        Ok(created)
    }

    async fn update_record(&self, id: &str, update: &SessionRecordUpdate) -> Result<SessionRecord> {
        let mut inner = self.inner();
        if inner.fail_records {
            return Err(WirefeedError::Transport("record store unavailable".to_string()));
        }
        let record = inner
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| WirefeedError::SessionNotFound(id.to_string()))?;
        update.apply(record);
        Ok(record.clone())
    }

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<SessionRecord>> {
        let inner = self.inner();
        if inner.fail_records || inner.fail_queries {
            return Err(WirefeedError::Transport("record store unavailable".to_string()));
        }
        Ok(inner
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EndReason;
    use chrono::Utc;

    #[test]
    fn test_publish_reaches_subscribers() {
        tokio_test::block_on(async {
            let transport = MemoryTransport::new();
            let mut sub = transport.subscribe().await.unwrap();
            transport.publish(RawArticle::new("a"));

            assert_eq!(sub.next().await, Some(PushEvent::Article(RawArticle::new("a"))));
            assert_eq!(transport.fetch_all().await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_disabled_push_still_serves_fetch() {
        tokio_test::block_on(async {
            let transport = MemoryTransport::new();
            let mut sub = transport.subscribe().await.unwrap();
            transport.set_push_enabled(false);
            transport.publish(RawArticle::new("a"));
            transport.fail_subscriptions("boom");

            // The article never arrived; the error did
            assert_eq!(sub.next().await, Some(PushEvent::Error("boom".into())));
            assert_eq!(transport.fetch_all().await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_unsubscribe_releases_sender() {
        tokio_test::block_on(async {
            let transport = MemoryTransport::new();
            let sub = transport.subscribe().await.unwrap();
            assert_eq!(transport.subscriber_count(), 1);
            drop(sub);
            assert_eq!(transport.subscriber_count(), 0);
        });
    }

    #[test]
    fn test_record_lifecycle() {
        tokio_test::block_on(async {
            let transport = MemoryTransport::new();
            let created = transport
                .create_record(&NewSessionRecord {
                    session_id: "s1".into(),
                    user_id: "u1".into(),
                    start_time: Utc::now(),
                    is_active: true,
                })
                .await
                .unwrap();

            let active = transport
                .query_records(&RecordFilter::for_user("u1").active(true))
                .await
                .unwrap();
            assert_eq!(active.len(), 1);

            let update = SessionRecordUpdate::ended(created.start_time, Utc::now(), EndReason::Logout);
            let updated = transport.update_record(&created.id, &update).await.unwrap();
            assert!(!updated.is_active);

            let err = transport.update_record("missing", &update).await.unwrap_err();
            assert!(matches!(err, WirefeedError::SessionNotFound(_)));
        });
    }
}
