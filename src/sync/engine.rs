use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::articles::SharedArticles;
use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::domain::{Article, ArticleUpdate, RawArticle};
use crate::normalizer::Normalizer;
use crate::sync::{SyncEvent, SyncState};
use crate::transport::{PushEvent, Subscription, Transport};

/// Handle to a running feed sync task for one user.
///
/// Dropping the handle terminates the task and releases the subscription.
pub struct FeedSync {
    articles: SharedArticles,
    state: Arc<watch::Sender<SyncState>>,
    initialized: Arc<AtomicBool>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FeedSync {
    pub fn start(
        transport: Arc<dyn Transport>,
        articles: SharedArticles,
        clock: Arc<dyn Clock>,
        config: FeedConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        let state = Arc::new(state_tx);
        let initialized = Arc::new(AtomicBool::new(false));
        let (cancel, cancel_rx) = watch::channel(false);

        let parts = EngineParts {
            transport,
            articles: articles.clone(),
            clock,
            config,
            state: state.clone(),
            initialized: initialized.clone(),
            cancel: cancel_rx,
        };
        let task = tokio::spawn(async move { FeedSyncEngine::new(parts).run().await });

        Self {
            articles,
            state,
            initialized,
            cancel,
            task: Some(task),
        }
    }

    /// Articles in display order.
    pub fn articles(&self) -> Vec<Article> {
        self.articles.lock().snapshot()
    }

    pub fn add_article(&self, article: Article) -> bool {
        self.articles.lock().add(article)
    }

    pub fn update_article(&self, id: &str, update: &ArticleUpdate) -> bool {
        self.articles.lock().update(id, update)
    }

    pub fn mark_article_as_seen(&self, id: &str) -> bool {
        self.articles.lock().mark_seen(id)
    }

    pub fn clear_articles(&self) {
        self.articles.lock().clear();
    }

    /// True once the initial fetch has completed (successfully or not).
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn shared_articles(&self) -> &SharedArticles {
        &self.articles
    }

    /// Stop immediately: timers cleared, subscription released, flags reset.
    /// Idempotent.
    pub fn terminate(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.initialized.store(false, Ordering::SeqCst);
        self.state.send_replace(SyncState::Terminated);
    }

    /// Ask the task to finish its current step and wait for it.
    pub async fn shutdown(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.terminate();
    }
}

impl Drop for FeedSync {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct EngineParts {
    transport: Arc<dyn Transport>,
    articles: SharedArticles,
    clock: Arc<dyn Clock>,
    config: FeedConfig,
    state: Arc<watch::Sender<SyncState>>,
    initialized: Arc<AtomicBool>,
    cancel: watch::Receiver<bool>,
}

struct FeedSyncEngine {
    transport: Arc<dyn Transport>,
    articles: SharedArticles,
    normalizer: Normalizer,
    clock: Arc<dyn Clock>,
    config: FeedConfig,
    state: SyncState,
    state_tx: Arc<watch::Sender<SyncState>>,
    initialized: Arc<AtomicBool>,
    cancel: watch::Receiver<bool>,
    subscription: Option<Subscription>,
    shadow_active: bool,
    poll: Interval,
    shadow: Interval,
}

impl FeedSyncEngine {
    fn new(parts: EngineParts) -> Self {
        let poll = delayed_interval(parts.config.poll_interval());
        let shadow = delayed_interval(parts.config.shadow_poll_interval());

        Self {
            transport: parts.transport,
            articles: parts.articles,
            normalizer: Normalizer::new(),
            clock: parts.clock,
            config: parts.config,
            state: SyncState::Idle,
            state_tx: parts.state,
            initialized: parts.initialized,
            cancel: parts.cancel,
            subscription: None,
            shadow_active: false,
            poll,
            shadow,
        }
    }

    async fn run(mut self) {
        self.transition(SyncEvent::Start);
        self.initial_fetch().await;

        loop {
            if self.state == SyncState::Terminated || *self.cancel.borrow() {
                break;
            }

            tokio::select! {
                _ = self.cancel.changed() => break,
                event = next_push(&mut self.subscription) => self.on_push(event),
                _ = self.poll.tick(), if self.state == SyncState::Polling => self.poll_tick().await,
                _ = self.shadow.tick(), if self.shadow_active => self.shadow_tick().await,
            }
        }

        self.release_subscription();
        self.shadow_active = false;
        self.transition(SyncEvent::Terminate);
    }

    async fn initial_fetch(&mut self) {
        match self.transport.fetch_all().await {
            Ok(raws) => {
                let count = self.merge(raws);
                info!(count, "Initial fetch seeded article store");
            }
            Err(e) => {
                warn!(error = %e, "Initial fetch failed, relying on push and polling");
            }
        }
        self.initialized.store(true, Ordering::SeqCst);

        match self.transport.subscribe().await {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.shadow_active = true;
                self.shadow.reset();
                self.transition(SyncEvent::Subscribed);
            }
            Err(e) => {
                warn!(error = %e, "Subscription failed, falling back to polling");
                self.poll.reset();
                self.transition(SyncEvent::SubscribeFailed);
            }
        }
    }

    fn on_push(&mut self, event: Option<PushEvent>) {
        match event {
            Some(PushEvent::Article(raw)) => {
                let inserted = self.merge(vec![raw]);
                debug!(inserted, "Push delivery");
                if self.state == SyncState::SubscribedUnverified {
                    self.transition(SyncEvent::PushDelivered);
                }
            }
            Some(PushEvent::Error(message)) => {
                warn!(error = %message, "Push channel error, falling back to polling");
                self.fall_back(SyncEvent::PushFailed);
            }
            None => {
                warn!("Push channel closed, falling back to polling");
                self.fall_back(SyncEvent::PushFailed);
            }
        }
    }

    async fn poll_tick(&mut self) {
        match self.transport.fetch_all().await {
            Ok(raws) => {
                let missing = self.missing(raws);
                if !missing.is_empty() {
                    let inserted = self.merge(missing);
                    info!(inserted, "Poll merged new articles");
                }
            }
            Err(e) => {
                warn!(error = %e, "Poll failed, retrying next interval");
            }
        }
    }

    /// Full fetch, wait out in-flight pushes, then diff. Any article the
    /// server has that we have never held means push dropped something.
    async fn shadow_tick(&mut self) {
        let server = match self.transport.fetch_all().await {
            Ok(raws) => raws,
            Err(e) => {
                warn!(error = %e, "Shadow poll failed, retrying next interval");
                return;
            }
        };

        let buffer = sleep(self.config.push_latency_buffer());
        tokio::pin!(buffer);
        loop {
            tokio::select! {
                _ = &mut buffer => break,
                _ = self.cancel.changed() => return,
                event = next_push(&mut self.subscription) => self.on_push(event),
            }
            if !self.state.is_subscribed() {
                return;
            }
        }

        let missing = self.missing(server);
        if !missing.is_empty() {
            warn!(
                missing = missing.len(),
                "Shadow poll found articles push never delivered, falling back to polling"
            );
            self.fall_back(SyncEvent::GapDetected);
            self.merge(missing);
        } else if self.state == SyncState::SubscribedVerified {
            info!("Push channel verified, stopping shadow poll");
            self.shadow_active = false;
        } else {
            debug!("Shadow poll found no gap, push not yet verified");
        }
    }

    /// Server articles absent from both the store and the seen cache.
    fn missing(&self, raws: Vec<RawArticle>) -> Vec<RawArticle> {
        let store = self.articles.lock();
        raws.into_iter()
            .filter(|raw| {
                let id = raw.id.trim();
                !id.is_empty() && !store.contains_or_seen(id)
            })
            .collect()
    }

    fn merge(&self, raws: Vec<RawArticle>) -> usize {
        let batch = self.normalizer.normalize_batch(raws, self.clock.now());
        self.articles.lock().merge(batch)
    }

    fn fall_back(&mut self, event: SyncEvent) {
        self.release_subscription();
        self.shadow_active = false;
        self.poll.reset();
        self.transition(event);
    }

    fn release_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    fn transition(&mut self, event: SyncEvent) {
        let next = self.state.on_event(event);
        if next != self.state {
            info!(from = ?self.state, to = ?next, "Feed sync state changed");
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }
}

fn delayed_interval(period: std::time::Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Next push event; pends forever when there is no subscription.
async fn next_push(subscription: &mut Option<Subscription>) -> Option<PushEvent> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}
