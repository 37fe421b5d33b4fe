use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::app::Result;
use crate::domain::{NewSessionRecord, RawArticle, RecordFilter, SessionRecord, SessionRecordUpdate};
use crate::transport::{PushEvent, Subscription, Transport};

const PUSH_BUFFER: usize = 256;

/// REST + streaming transport.
///
/// * `GET  articles`         full article set
/// * `GET  articles/stream`  newline-delimited JSON (bare or `data:` framed)
/// * `POST sessions`, `PATCH sessions/{id}`, `GET sessions?userId=..`
pub struct HttpTransport {
    client: Client,
    stream_client: Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut endpoint = endpoint.trim().to_string();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base = Url::parse(&endpoint)?;

        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .brotli(true)
            .user_agent("wirefeed/0.1.0")
            .build()?;

        // The push stream is long-lived; only the connect phase is bounded.
        let stream_client = Client::builder()
            .connect_timeout(timeout)
            .user_agent("wirefeed/0.1.0")
            .build()?;

        Ok(Self {
            client,
            stream_client,
            base,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_all(&self) -> Result<Vec<RawArticle>> {
        let response = self.client.get(self.url("articles")?).send().await?;
        response.error_for_status_ref()?;
        Ok(response.json().await?)
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let response = self
            .stream_client
            .get(self.url("articles/stream")?)
            .send()
            .await?;
        response.error_for_status_ref()?;

        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(PushEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.extend_from_slice(&bytes);

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let Some(article) = parse_stream_line(&line) else {
                        continue;
                    };
                    if tx.send(PushEvent::Article(article)).await.is_err() {
                        return;
                    }
                }
            }

            let _ = tx
                .send(PushEvent::Error("push stream ended".to_string()))
                .await;
        });

        Ok(Subscription::with_task(rx, task))
    }

    async fn create_record(&self, record: &NewSessionRecord) -> Result<SessionRecord> {
        let response = self
            .client
            .post(self.url("sessions")?)
            .json(record)
            .send()
            .await?;
        response.error_for_status_ref()?;
        Ok(response.json().await?)
    }

    async fn update_record(&self, id: &str, update: &SessionRecordUpdate) -> Result<SessionRecord> {
        let response = self
            .client
            .patch(self.url(&format!("sessions/{}", id))?)
            .json(update)
            .send()
            .await?;
        response.error_for_status_ref()?;
        Ok(response.json().await?)
    }

    async fn query_records(&self, filter: &RecordFilter) -> Result<Vec<SessionRecord>> {
        let mut query = vec![("userId", filter.user_id.clone())];
        if let Some(ref session_id) = filter.session_id {
            query.push(("sessionId", session_id.clone()));
        }
        if let Some(is_active) = filter.is_active {
            query.push(("isActive", is_active.to_string()));
        }

        let response = self
            .client
            .get(self.url("sessions")?)
            .query(&query)
            .send()
            .await?;
        response.error_for_status_ref()?;
        Ok(response.json().await?)
    }
}

/// One line of the push stream. Blank lines, comments and non-data SSE
/// fields are skipped, as are payloads that fail to decode.
fn parse_stream_line(line: &[u8]) -> Option<RawArticle> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() || text.starts_with(':') {
        return None;
    }
    let payload = match text.strip_prefix("data:") {
        Some(data) => data.trim(),
        None if text.starts_with('{') => text,
        None => {
            debug!(line = text, "Skipping non-data stream line");
            return None;
        }
    };

    match serde_json::from_str(payload) {
        Ok(article) => Some(article),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable push payload");
            None
        }
    }
}
