//! Supervisor that drives the client from the auth status stream.
//!
//! For each signed-in user it runs the startup sweep, restores or starts a
//! session, arms the inactivity timer and runs the feed engine while the
//! session is active. A user change or sign-out tears all of it down.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::app::{AppContext, Result};
use crate::articles::SharedArticles;
use crate::domain::EndReason;
use crate::inactivity::{InactivityEvent, InactivityTimer, Interaction};
use crate::session::{
    AuthProvider, SessionLifecycleManager, SessionTasks, Visibility, VisibilityOutcome,
};
use crate::sync::{FeedSync, SyncState};

/// Input reported by whatever hosts the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Interaction(Interaction),
    Visibility(Visibility),
}

/// Snapshot of what the supervisor is running.
#[derive(Clone, Default)]
pub struct SupervisorStatus {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub sync_state: Option<SyncState>,
    pub articles: Option<SharedArticles>,
}

pub struct Supervisor {
    ctx: Arc<AppContext>,
    auth: Arc<dyn AuthProvider>,
    status: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(ctx: Arc<AppContext>, auth: Arc<dyn AuthProvider>) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self { ctx, auth, status }
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    /// Run until `shutdown` resolves or the auth stream closes. An auth
    /// error while bootstrapping a session stops the supervisor.
    pub async fn run(
        self,
        mut host_events: mpsc::UnboundedReceiver<HostEvent>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut auth_state = self.auth.state();
        let mut runtime: Option<UserRuntime> = None;
        tokio::pin!(shutdown);

        loop {
            let current = auth_state.borrow_and_update().clone();
            match current.user() {
                Some(user) if runtime.as_ref().is_some_and(|r| r.user_id == user) => {}
                Some(user) => {
                    if let Some(previous) = runtime.take() {
                        info!(user_id = %previous.user_id, "User changed, tearing down");
                        previous.stop(Some(EndReason::Logout)).await;
                    }
                    match UserRuntime::start(&self.ctx, self.auth.clone(), user).await {
                        Ok(started) => runtime = Some(started),
                        Err(e) if e.is_auth() => {
                            error!(user_id = user, error = %e, "Session bootstrap failed");
                            self.publish(None);
                            return Err(e);
                        }
                        Err(e) => warn!(user_id = user, error = %e, "Session bootstrap failed"),
                    }
                }
                None => {
                    if let Some(previous) = runtime.take() {
                        info!(user_id = %previous.user_id, "Signed out, tearing down");
                        previous.stop(Some(EndReason::Logout)).await;
                    }
                }
            }
            if let Some(ref mut active) = runtime {
                active.reconcile(&self.ctx);
            }
            self.publish(runtime.as_ref());

            tokio::select! {
                _ = &mut shutdown => break,
                changed = auth_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(event) = host_events.recv() => {
                    if let Some(ref active) = runtime {
                        active.on_host_event(event).await;
                    }
                }
                event = next_runtime_event(&mut runtime) => {
                    if let Some(ref mut active) = runtime {
                        active.on_runtime_event(event).await;
                    }
                }
            }
        }

        if let Some(active) = runtime.take() {
            active.stop(None).await;
        }
        self.publish(None);
        info!("Supervisor stopped");
        Ok(())
    }

    fn publish(&self, runtime: Option<&UserRuntime>) {
        let status = match runtime {
            Some(runtime) => SupervisorStatus {
                user_id: Some(runtime.user_id.clone()),
                session_id: runtime.manager.session_id(),
                sync_state: runtime.feed.as_ref().map(|f| f.state()),
                articles: runtime.feed.as_ref().map(|f| f.shared_articles().clone()),
            },
            None => SupervisorStatus::default(),
        };
        self.status.send_replace(status);
    }
}

enum RuntimeEvent {
    Inactivity(InactivityEvent),
    SessionChanged,
}

/// Everything running on behalf of one signed-in user.
struct UserRuntime {
    user_id: String,
    auth: Arc<dyn AuthProvider>,
    manager: Arc<SessionLifecycleManager>,
    tasks: SessionTasks,
    timer: InactivityTimer,
    inactivity: mpsc::UnboundedReceiver<InactivityEvent>,
    session: watch::Receiver<Option<String>>,
    feed: Option<FeedSync>,
}

impl UserRuntime {
    async fn start(ctx: &AppContext, auth: Arc<dyn AuthProvider>, user_id: &str) -> Result<Self> {
        let manager = Arc::new(ctx.session_manager(auth.clone()));
        manager.startup_sweep(user_id).await?;
        manager.restore_or_start(user_id).await?;

        let tasks = manager.spawn_background();
        let on_activity = {
            let manager = manager.clone();
            Arc::new(move || manager.touch())
        };
        let (timer, inactivity) = InactivityTimer::from_config(&ctx.config.inactivity, on_activity);
        let session = manager.subscribe_session();

        Ok(Self {
            user_id: user_id.to_string(),
            auth,
            manager,
            tasks,
            timer,
            inactivity,
            session,
            feed: None,
        })
    }

    /// Run the feed engine exactly while the session is usable.
    fn reconcile(&mut self, ctx: &AppContext) {
        let usable = self.manager.is_authenticated() && self.manager.is_session_active();
        match (&self.feed, usable) {
            (None, true) => {
                info!(user_id = %self.user_id, "Starting feed sync");
                let articles = ctx.article_store(&self.manager);
                self.feed = Some(FeedSync::start(
                    ctx.transport.clone(),
                    articles,
                    ctx.clock.clone(),
                    ctx.config.feed.clone(),
                ));
            }
            (Some(_), false) => {
                info!(user_id = %self.user_id, "Session inactive, stopping feed sync");
                self.feed = None;
            }
            _ => {}
        }
    }

    async fn on_host_event(&self, event: HostEvent) {
        match event {
            HostEvent::Interaction(interaction) => {
                // The timer's activity callback stamps the session
                self.timer.record(interaction);
            }
            HostEvent::Visibility(visibility) => {
                match self.manager.on_visibility_change(visibility).await {
                    Ok(VisibilityOutcome::Restarted { previous, current }) => {
                        info!(%previous, %current, "Session restarted");
                    }
                    Ok(outcome) => debug!(?outcome, "Visibility change"),
                    Err(e) => warn!(error = %e, "Visibility change failed"),
                }
            }
        }
    }

    async fn on_runtime_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Inactivity(InactivityEvent::Warning { remaining }) => {
                warn!(remaining_secs = remaining.as_secs(), "Logging out soon due to inactivity");
            }
            RuntimeEvent::Inactivity(InactivityEvent::Logout) => {
                info!(user_id = %self.user_id, "Inactivity timeout, logging out");
                self.feed = None;
                if let Err(e) = self.manager.end_session(EndReason::Inactivity).await {
                    warn!(error = %e, "Failed to end session");
                }
                if let Err(e) = self.auth.sign_out().await {
                    warn!(error = %e, "Sign out failed");
                }
            }
            RuntimeEvent::SessionChanged => {
                let session_id = self.session.borrow_and_update().clone();
                debug!(?session_id, "Session changed");
            }
        }
    }

    async fn next_event(&mut self) -> RuntimeEvent {
        tokio::select! {
            Some(event) = self.inactivity.recv() => RuntimeEvent::Inactivity(event),
            Ok(()) = self.session.changed() => RuntimeEvent::SessionChanged,
            else => std::future::pending().await,
        }
    }

    async fn stop(mut self, reason: Option<EndReason>) {
        if let Some(mut feed) = self.feed.take() {
            feed.terminate();
        }
        self.timer.stop();
        self.tasks.stop();
        if let Some(reason) = reason {
            if self.manager.is_session_active() {
                if let Err(e) = self.manager.end_session(reason).await {
                    warn!(error = %e, "Failed to end session");
                }
            }
        }
    }
}

async fn next_runtime_event(runtime: &mut Option<UserRuntime>) -> RuntimeEvent {
    match runtime {
        Some(runtime) => runtime.next_event().await,
        None => std::future::pending().await,
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {},
                    _ = sigint.recv() => {},
                }
            }
            _ => {
                warn!("Could not install signal handlers, falling back to Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(windows)]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
