pub mod http;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::app::Result;
use crate::domain::{NewSessionRecord, RawArticle, RecordFilter, SessionRecord, SessionRecordUpdate};

pub use http::HttpTransport;
pub use memory::MemoryTransport;

/// Something delivered over the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Article(RawArticle),
    Error(String),
}

/// A live push subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<PushEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<PushEvent>) -> Self {
        Self { events, task: None }
    }

    /// Subscription backed by a reader task that is aborted on unsubscribe.
    pub fn with_task(events: mpsc::Receiver<PushEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Next event; `None` once the channel has closed.
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Backend the client talks to: the article feed plus session records.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<RawArticle>>;

    async fn subscribe(&self) -> Result<Subscription>;

    async fn create_record(&self, record: &NewSessionRecord) -> Result<SessionRecord>;

    async fn update_record(&self, id: &str, update: &SessionRecordUpdate) -> Result<SessionRecord>;

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<SessionRecord>>;
}
