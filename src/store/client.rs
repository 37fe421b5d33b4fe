//! Shared client storage with per-tab change notifications.
//!
//! Every [`ClientStorage`] handle belongs to a tab. Handles created through
//! [`ClientStorage::open_tab`] share the backend and the change channel, and
//! each tab only hears about writes made by the others. Writes made by other
//! processes on the same backend are picked up for watched keys by
//! [`ClientStorage::poll_external`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::app::{Result, WirefeedError};
use crate::store::{MemoryStore, Store};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Origin of events for writes made outside this process.
pub const EXTERNAL_ORIGIN: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: u64,
}

/// Last state of a watched key as this process knows it.
struct Known {
    revision: Option<String>,
    value: Option<String>,
}

#[derive(Clone)]
pub struct ClientStorage {
    backend: Arc<dyn Store + Send + Sync>,
    events: broadcast::Sender<StorageEvent>,
    next_tab: Arc<AtomicU64>,
    tab_id: u64,
    watched: Arc<Mutex<HashMap<String, Known>>>,
}

impl ClientStorage {
    pub fn new(backend: Arc<dyn Store + Send + Sync>) -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            backend,
            events,
            next_tab: Arc::new(AtomicU64::new(1)),
            tab_id: 0,
            watched: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// A sibling handle on the same backend with its own tab identity.
    pub fn open_tab(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            events: self.events.clone(),
            next_tab: self.next_tab.clone(),
            tab_id: self.next_tab.fetch_add(1, Ordering::Relaxed),
            watched: self.watched.clone(),
        }
    }

    pub fn tab_id(&self) -> u64 {
        self.tab_id
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key).map_err(persistence)
    }

    /// Reads and decodes a JSON value. Undecodable content is a
    /// persistence error, same as an unreadable key.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| WirefeedError::Persistence(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let old_value = {
            let mut watched = self.watched();
            let old_value = self.backend.get(key).ok().flatten();
            self.backend.set(key, value).map_err(persistence)?;
            self.remember(&mut watched, key, Some(value.to_string()));
            old_value
        };
        self.notify(key, old_value, Some(value.to_string()));
        Ok(())
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let old_value = {
            let mut watched = self.watched();
            let old_value = self.backend.get(key).ok().flatten();
            self.backend.remove(key).map_err(persistence)?;
            self.remember(&mut watched, key, None);
            old_value
        };
        if old_value.is_some() {
            self.notify(key, old_value, None);
        }
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys().map_err(persistence)
    }

    /// Stream of writes made by other tabs.
    pub fn changes(&self) -> StorageChanges {
        StorageChanges {
            rx: self.events.subscribe(),
            tab_id: self.tab_id,
        }
    }

    /// Start tracking `key` for writes made by other processes.
    pub fn watch_key(&self, key: &str) -> Result<()> {
        let mut watched = self.watched();
        if watched.contains_key(key) {
            return Ok(());
        }
        let revision = self.backend.revision(key).map_err(persistence)?;
        let value = self.backend.get(key).map_err(persistence)?;
        watched.insert(key.to_string(), Known { revision, value });
        Ok(())
    }

    /// Compare watched keys against the backend and announce writes this
    /// process did not make. Returns how many were found.
    pub fn poll_external(&self) -> usize {
        let mut found = Vec::new();
        {
            let mut watched = self.watched();
            for (key, known) in watched.iter_mut() {
                let revision = match self.backend.revision(key) {
                    Ok(revision) => revision,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Could not check key for outside writes");
                        continue;
                    }
                };
                if revision == known.revision {
                    continue;
                }
                let value = match self.backend.get(key) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Could not read key written outside");
                        continue;
                    }
                };
                known.revision = revision;
                let old_value = std::mem::replace(&mut known.value, value.clone());
                found.push(StorageEvent {
                    key: key.clone(),
                    old_value,
                    new_value: value,
                    origin: EXTERNAL_ORIGIN,
                });
            }
        }

        let count = found.len();
        for event in found {
            debug!(key = %event.key, "Key changed outside this process");
            let _ = self.events.send(event);
        }
        count
    }

    /// Run [`poll_external`](Self::poll_external) every `period` until the
    /// task is aborted.
    pub fn spawn_external_watch(&self, period: Duration) -> JoinHandle<()> {
        let storage = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                storage.poll_external();
            }
        })
    }

    fn watched(&self) -> MutexGuard<'_, HashMap<String, Known>> {
        self.watched.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keep a watched key's baseline in step with this process's own writes.
    fn remember(&self, watched: &mut HashMap<String, Known>, key: &str, value: Option<String>) {
        if let Some(known) = watched.get_mut(key) {
            known.revision = self.backend.revision(key).ok().flatten();
            known.value = value;
        }
    }

    fn notify(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // No receivers is fine
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            origin: self.tab_id,
        });
    }
}

fn persistence(e: WirefeedError) -> WirefeedError {
    match e {
        WirefeedError::Persistence(_) => e,
        other => WirefeedError::Persistence(other.to_string()),
    }
}

pub struct StorageChanges {
    rx: broadcast::Receiver<StorageEvent>,
    tab_id: u64,
}

impl StorageChanges {
    /// Next foreign write, or `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<StorageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.origin == self.tab_id => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage change listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pref {
        theme: String,
    }

    #[test]
    fn test_json_roundtrip() {
        let storage = ClientStorage::in_memory();
        storage
            .set_json("pref:ui", &Pref { theme: "dark".into() })
            .unwrap();
        let pref: Option<Pref> = storage.get_json("pref:ui").unwrap();
        assert_eq!(pref, Some(Pref { theme: "dark".into() }));
    }

    #[test]
    fn test_corrupt_json_is_persistence_error() {
        let storage = ClientStorage::in_memory();
        storage.set("pref:ui", "{not json").unwrap();
        let err = storage.get_json::<Pref>("pref:ui").unwrap_err();
        assert!(matches!(err, WirefeedError::Persistence(_)));
    }

    #[test]
    fn test_tabs_share_backend() {
        let first = ClientStorage::in_memory();
        let second = first.open_tab();
        assert_ne!(first.tab_id(), second.tab_id());

        first.set("k", "v").unwrap();
        assert_eq!(second.get("k").unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn test_changes_skip_own_writes() {
        let first = ClientStorage::in_memory();
        let second = first.open_tab();
        let mut changes = first.changes();

        first.set("own", "1").unwrap();
        second.set("foreign", "2").unwrap();

        let event = changes.recv().await.unwrap();
        assert_eq!(event.key, "foreign");
        assert_eq!(event.new_value, Some("2".into()));
        assert_eq!(event.origin, second.tab_id());
    }

    #[tokio::test]
    async fn test_outside_writes_on_shared_file_are_announced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirefeed.db");
        let ours = ClientStorage::new(Arc::new(SqliteStore::new(&path).unwrap()));
        let theirs = ClientStorage::new(Arc::new(SqliteStore::new(&path).unwrap()));

        ours.set("session", "mine").unwrap();
        ours.watch_key("session").unwrap();
        let mut changes = ours.changes();

        // Own writes are not outside writes
        ours.set("session", "mine again").unwrap();
        assert_eq!(ours.poll_external(), 0);

        theirs.remove("session").unwrap();
        assert_eq!(ours.poll_external(), 1);
        assert_eq!(ours.poll_external(), 0);

        let event = changes.recv().await.unwrap();
        assert_eq!(event.origin, EXTERNAL_ORIGIN);
        assert_eq!(event.old_value, Some("mine again".into()));
        assert_eq!(event.new_value, None);
    }

    #[test]
    fn test_unwatched_keys_are_not_polled() {
        let storage = ClientStorage::in_memory();
        storage.set("k", "v").unwrap();
        assert_eq!(storage.poll_external(), 0);
    }

    #[tokio::test]
    async fn test_remove_reports_old_value() {
        let first = ClientStorage::in_memory();
        let second = first.open_tab();
        first.set("k", "v").unwrap();

        let mut changes = first.changes();
        second.remove("k").unwrap();

        let event = changes.recv().await.unwrap();
        assert_eq!(event.old_value, Some("v".into()));
        assert_eq!(event.new_value, None);
    }
}
