use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app::{Result, WirefeedError};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::domain::{
    EndReason, NewSessionRecord, RecordFilter, SessionDescriptor, SessionRecordUpdate,
};
use crate::inactivity::Interaction;
use crate::session::{AuthProvider, AuthStatus, Visibility, VisibilityOutcome, SESSION_KEY};
use crate::store::{ClientStorage, ReadStateStore, StorageEvent};
use crate::transport::Transport;

enum WriteBack {
    Written,
    /// Storage holds no session, or one of another user.
    Cleared,
    /// Storage holds another session of the same user.
    Replaced(SessionDescriptor),
}

#[derive(Default)]
struct LocalSession {
    descriptor: Option<SessionDescriptor>,
    /// Whether the remote record is still believed active. The sweep flips
    /// it so the record is only marked inactive once.
    remote_active: bool,
}

/// Owns the session identity for one tab: creation, restore, restart after a
/// long hidden period, staleness sweeps and teardown.
pub struct SessionLifecycleManager {
    storage: ClientStorage,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    read_state: ReadStateStore,
    local: Mutex<LocalSession>,
    session_tx: watch::Sender<Option<String>>,
}

impl SessionLifecycleManager {
    pub fn new(
        storage: ClientStorage,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
    ) -> Self {
        let read_state = ReadStateStore::with_cap(storage.clone(), config.read_state_cap);
        let (session_tx, _) = watch::channel(None);
        Self {
            storage,
            transport,
            auth,
            clock,
            config,
            read_state,
            local: Mutex::new(LocalSession::default()),
            session_tx,
        }
    }

    fn local(&self) -> MutexGuard<'_, LocalSession> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adopt the stored session if it is still valid for this user, or start
    /// a new one. Only a failure to create the new record is an error.
    pub async fn restore_or_start(&self, user_id: &str) -> Result<SessionDescriptor> {
        let now = self.clock.now();

        if let Some(descriptor) = self.try_restore(user_id, now).await {
            info!(session_id = %descriptor.session_id, "Restored session");
            self.adopt(descriptor.clone(), true);
            return Ok(descriptor);
        }

        self.start_new(user_id, now).await
    }

    async fn try_restore(&self, user_id: &str, now: DateTime<Utc>) -> Option<SessionDescriptor> {
        let stored = match self.storage.get_json::<SessionDescriptor>(SESSION_KEY) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Stored session unreadable");
                self.discard_stored();
                return None;
            }
        };

        if stored.user_id != user_id {
            debug!("Stored session belongs to another user");
            self.discard_stored();
            return None;
        }
        if stored.age(now) >= self.config.hard_logout() {
            debug!(session_id = %stored.session_id, "Stored session past hard logout age");
            self.discard_stored();
            return None;
        }

        let filter = RecordFilter::for_user(user_id).session(&stored.session_id);
        let remote_active = match self.transport.query_records(&filter).await {
            Ok(records) => records
                .iter()
                .any(|r| r.id == stored.record_id && r.is_active),
            Err(e) => {
                warn!(error = %e, "Session record lookup failed, starting fresh");
                false
            }
        };

        if remote_active {
            Some(stored)
        } else {
            debug!(session_id = %stored.session_id, "Remote record no longer active");
            self.discard_stored();
            None
        }
    }

    async fn start_new(&self, user_id: &str, now: DateTime<Utc>) -> Result<SessionDescriptor> {
        let record = NewSessionRecord {
            session_id: SessionDescriptor::generate_id(user_id, now),
            user_id: user_id.to_string(),
            start_time: now,
            is_active: true,
        };

        let created = self
            .transport
            .create_record(&record)
            .await
            .map_err(|e| WirefeedError::Auth(format!("could not create session: {}", e)))?;

        let descriptor = SessionDescriptor::new(&created, now);
        info!(session_id = %descriptor.session_id, record_id = %descriptor.record_id, "Started session");
        self.persist(&descriptor);
        self.adopt(descriptor.clone(), true);
        Ok(descriptor)
    }

    /// Take over the stored descriptor as is, without checking the remote
    /// record. Used by one-shot commands that act on an existing session.
    pub fn attach_stored(&self) -> Result<Option<SessionDescriptor>> {
        let stored = self.storage.get_json::<SessionDescriptor>(SESSION_KEY)?;
        if let Some(ref descriptor) = stored {
            self.adopt(descriptor.clone(), true);
        }
        Ok(stored)
    }

    fn adopt(&self, descriptor: SessionDescriptor, remote_active: bool) {
        let session_id = descriptor.session_id.clone();
        {
            let mut local = self.local();
            local.descriptor = Some(descriptor);
            local.remote_active = remote_active;
        }
        self.publish(Some(session_id));
    }

    fn publish(&self, session_id: Option<String>) {
        self.session_tx.send_if_modified(|current| {
            if *current == session_id {
                false
            } else {
                *current = session_id;
                true
            }
        });
    }

    fn persist(&self, descriptor: &SessionDescriptor) {
        if let Err(e) = self.storage.set_json(SESSION_KEY, descriptor) {
            warn!(error = %e, "Failed to persist session descriptor");
        }
    }

    fn discard_stored(&self) {
        if let Err(e) = self.storage.remove(SESSION_KEY) {
            warn!(error = %e, "Failed to discard stored session");
        }
    }

    /// Note user activity. Only deliberate input counts.
    pub fn record_activity(&self, interaction: Interaction) -> bool {
        if !interaction.is_qualifying() {
            return false;
        }
        self.touch();
        true
    }

    /// Stamp the activity time without classifying the input.
    pub fn touch(&self) {
        let now = self.clock.now();
        let written = {
            let mut local = self.local();
            let Some(ref mut descriptor) = local.descriptor else {
                return;
            };
            descriptor.last_user_activity = now;
            self.write_back(descriptor)
        };
        self.settle_write_back(written);
    }

    /// Persist the local descriptor unless storage now holds something else.
    /// For the same session the newer timestamps are merged in first.
    fn write_back(&self, descriptor: &mut SessionDescriptor) -> WriteBack {
        match self.storage.get_json::<SessionDescriptor>(SESSION_KEY) {
            Ok(None) => return WriteBack::Cleared,
            Ok(Some(stored)) if stored.session_id != descriptor.session_id => {
                return if stored.user_id == descriptor.user_id {
                    WriteBack::Replaced(stored)
                } else {
                    WriteBack::Cleared
                };
            }
            Ok(Some(stored)) => {
                descriptor.last_user_activity =
                    descriptor.last_user_activity.max(stored.last_user_activity);
                descriptor.last_visibility_event =
                    descriptor.last_visibility_event.max(stored.last_visibility_event);
            }
            Err(e) => warn!(error = %e, "Stored session unreadable, overwriting"),
        }
        self.persist(descriptor);
        WriteBack::Written
    }

    /// Act on a write-back that found another owner. Returns whether the
    /// local session is still the stored one.
    fn settle_write_back(&self, written: WriteBack) -> bool {
        match written {
            WriteBack::Written => true,
            WriteBack::Cleared => {
                info!("Session ended elsewhere");
                self.drop_local();
                false
            }
            WriteBack::Replaced(stored) => {
                info!(session_id = %stored.session_id, "Session replaced elsewhere, adopting");
                self.adopt(stored, true);
                false
            }
        }
    }

    pub async fn on_visibility_change(&self, visibility: Visibility) -> Result<VisibilityOutcome> {
        let now = self.clock.now();

        let (written, hidden_at) = {
            let mut local = self.local();
            let Some(ref mut descriptor) = local.descriptor else {
                return Ok(VisibilityOutcome::NoSession);
            };
            descriptor.last_visibility_event = Some(now);

            let hidden_at = match visibility {
                Visibility::Hidden => {
                    descriptor.last_tab_hidden_time = Some(now);
                    None
                }
                Visibility::Visible => descriptor.last_tab_hidden_time.take(),
            };
            (self.write_back(descriptor), hidden_at)
        };

        if !self.settle_write_back(written) {
            return Ok(VisibilityOutcome::NoSession);
        }
        let Some(hidden_at) = hidden_at else {
            return Ok(VisibilityOutcome::Recorded);
        };
        let hidden_for = now - hidden_at;

        if hidden_for < self.config.soft_expiration() {
            Ok(VisibilityOutcome::Resumed)
        } else if hidden_for < self.config.hard_logout() {
            info!(hidden_secs = hidden_for.num_seconds(), "Session stale after hidden tab, restarting");
            self.restart(now).await
        } else {
            // Left to the inactivity logout
            debug!(hidden_secs = hidden_for.num_seconds(), "Hidden past hard logout");
            Ok(VisibilityOutcome::Expired)
        }
    }

    /// End the current record and continue under a new session id,
    /// carrying the read state over.
    async fn restart(&self, now: DateTime<Utc>) -> Result<VisibilityOutcome> {
        let Some(old) = self.descriptor() else {
            return Ok(VisibilityOutcome::NoSession);
        };

        let update = SessionRecordUpdate::ended(old.start_time, now, EndReason::Restarted);
        if let Err(e) = self.transport.update_record(&old.record_id, &update).await {
            warn!(session_id = %old.session_id, error = %e, "Failed to end stale session record");
        }

        let new = match self.start_new(&old.user_id, now).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.drop_local();
                return Err(e);
            }
        };

        match self.read_state.migrate(&old.session_id, &new.session_id) {
            Ok(count) => debug!(count, "Migrated read state"),
            Err(e) => warn!(error = %e, "Failed to migrate read state"),
        }

        Ok(VisibilityOutcome::Restarted {
            previous: old.session_id,
            current: new.session_id,
        })
    }

    /// Mark the remote record inactive when the tab has shown no sign of
    /// life for the soft expiration period. Returns whether it did.
    pub async fn sweep(&self) -> Result<bool> {
        let now = self.clock.now();

        let (record_id, start_time) = {
            let mut local = self.local();
            if !local.remote_active {
                return Ok(false);
            }
            let Some(ref descriptor) = local.descriptor else {
                return Ok(false);
            };
            if descriptor.idle_for(now) < self.config.soft_expiration() {
                return Ok(false);
            }
            let target = (descriptor.record_id.clone(), descriptor.start_time);
            local.remote_active = false;
            target
        };

        let update = SessionRecordUpdate::ended(start_time, now, EndReason::Stale);
        match self.transport.update_record(&record_id, &update).await {
            Ok(_) => {
                info!(record_id = %record_id, "Marked idle session inactive");
                Ok(true)
            }
            Err(e) => {
                warn!(record_id = %record_id, error = %e, "Sweep failed to mark session inactive");
                self.local().remote_active = true;
                Ok(false)
            }
        }
    }

    /// Close the remote record and clear local state, keeping only the
    /// preserved keys.
    pub async fn end_session(&self, reason: EndReason) -> Result<()> {
        let now = self.clock.now();
        let descriptor = {
            let mut local = self.local();
            local.remote_active = false;
            local.descriptor.take()
        };
        self.publish(None);

        if let Some(ref descriptor) = descriptor {
            let update = SessionRecordUpdate::ended(descriptor.start_time, now, reason);
            match self.transport.update_record(&descriptor.record_id, &update).await {
                Ok(_) => info!(
                    session_id = %descriptor.session_id,
                    duration_secs = update.duration_secs.unwrap_or_default(),
                    ?reason,
                    "Session ended"
                ),
                Err(e) => warn!(
                    session_id = %descriptor.session_id,
                    error = %e,
                    "Failed to close session record"
                ),
            }
        }

        self.clear_local_keys();
        Ok(())
    }

    fn clear_local_keys(&self) {
        let keys = match self.storage.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Could not list local keys");
                return;
            }
        };
        for key in keys.iter().filter(|k| !self.config.is_preserved(k)) {
            if let Err(e) = self.storage.remove(key) {
                warn!(key = %key, error = %e, "Failed to clear local key");
            }
        }
    }

    pub async fn logout(&self) -> Result<()> {
        self.end_session(EndReason::Logout).await?;
        self.auth.sign_out().await
    }

    /// Force-expire the user's records still active past the hard logout
    /// age, left behind by closed tabs. Returns how many were expired.
    pub async fn startup_sweep(&self, user_id: &str) -> Result<usize> {
        let now = self.clock.now();
        let filter = RecordFilter::for_user(user_id).active(true);
        let records = match self.transport.query_records(&filter).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Startup sweep could not list sessions");
                return Ok(0);
            }
        };

        let mut expired = 0;
        for record in records
            .iter()
            .filter(|r| now - r.start_time >= self.config.hard_logout())
        {
            let update = SessionRecordUpdate::ended(record.start_time, now, EndReason::Expired);
            match self.transport.update_record(&record.id, &update).await {
                Ok(_) => expired += 1,
                Err(e) => warn!(record_id = %record.id, error = %e, "Failed to expire session"),
            }
        }

        if expired > 0 {
            info!(expired, "Expired abandoned sessions");
        }
        Ok(expired)
    }

    /// Reconcile with a descriptor write made by another tab. Last writer
    /// wins; for the same session the newer activity time is kept.
    pub fn handle_storage_event(&self, event: &StorageEvent) {
        if event.key != SESSION_KEY {
            return;
        }

        let Some(ref raw) = event.new_value else {
            if self.descriptor().is_some() {
                info!("Session cleared by another tab");
                self.drop_local();
            }
            return;
        };

        let incoming: SessionDescriptor = match serde_json::from_str(raw) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session from another tab");
                return;
            }
        };

        let adopted = {
            let mut local = self.local();
            match local.descriptor {
                Some(ref mut current) if current.session_id == incoming.session_id => {
                    current.last_user_activity =
                        current.last_user_activity.max(incoming.last_user_activity);
                    current.last_visibility_event =
                        current.last_visibility_event.max(incoming.last_visibility_event);
                    None
                }
                Some(ref current) if current.user_id != incoming.user_id => {
                    debug!("Ignoring session of another user");
                    None
                }
                _ => Some(incoming),
            }
        };

        if let Some(descriptor) = adopted {
            info!(session_id = %descriptor.session_id, "Adopted session from another tab");
            self.adopt(descriptor, true);
        }
    }

    fn drop_local(&self) {
        {
            let mut local = self.local();
            local.descriptor = None;
            local.remote_active = false;
        }
        self.publish(None);
    }

    /// Start the periodic sweep, the cross-tab listener and the watch for
    /// session writes from other processes.
    pub fn spawn_background(self: &Arc<Self>) -> SessionTasks {
        if let Err(e) = self.storage.watch_key(SESSION_KEY) {
            warn!(error = %e, "Cannot watch session for outside writes");
        }
        let external = self
            .storage
            .spawn_external_watch(self.config.storage_poll_interval());
        let mut changes = self.storage.changes();
        let listener = {
            let manager = self.clone();
            tokio::spawn(async move {
                while let Some(event) = changes.recv().await {
                    manager.handle_storage_event(&event);
                }
            })
        };

        let sweeper = {
            let manager = self.clone();
            let period = self.config.sweep_interval();
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if let Err(e) = manager.sweep().await {
                        warn!(error = %e, "Session sweep failed");
                    }
                }
            })
        };

        SessionTasks {
            handles: vec![listener, sweeper, external],
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.state().borrow().status == AuthStatus::Authenticated
    }

    pub fn is_session_active(&self) -> bool {
        self.local().descriptor.is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        if let Some(ref descriptor) = self.local().descriptor {
            return Some(descriptor.user_id.clone());
        }
        self.auth.state().borrow().user().map(str::to_string)
    }

    pub fn session_id(&self) -> Option<String> {
        self.local().descriptor.as_ref().map(|d| d.session_id.clone())
    }

    pub fn descriptor(&self) -> Option<SessionDescriptor> {
        self.local().descriptor.clone()
    }

    /// Watch of the current session id, `None` while there is none.
    pub fn subscribe_session(&self) -> watch::Receiver<Option<String>> {
        self.session_tx.subscribe()
    }

    pub fn read_state(&self) -> &ReadStateStore {
        &self.read_state
    }
}

/// Background tasks of a manager; aborted on drop.
pub struct SessionTasks {
    handles: Vec<JoinHandle<()>>,
}

impl SessionTasks {
    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        self.stop();
    }
}
