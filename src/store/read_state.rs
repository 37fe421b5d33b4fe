use tracing::warn;

use crate::app::Result;
use crate::domain::state::DEFAULT_READ_STATE_CAP;
use crate::domain::ReadState;
use crate::store::ClientStorage;

pub const READ_STATE_PREFIX: &str = "read_articles:";

/// Per-session read-article sets, one storage key per session id.
#[derive(Clone)]
pub struct ReadStateStore {
    storage: ClientStorage,
    cap: usize,
}

impl ReadStateStore {
    pub fn new(storage: ClientStorage) -> Self {
        Self::with_cap(storage, DEFAULT_READ_STATE_CAP)
    }

    pub fn with_cap(storage: ClientStorage, cap: usize) -> Self {
        Self { storage, cap }
    }

    pub fn key(session_id: &str) -> String {
        format!("{}{}", READ_STATE_PREFIX, session_id)
    }

    /// Load a session's read set. Unreadable state is treated as empty.
    pub fn load(&self, session_id: &str) -> ReadState {
        match self.storage.get_json::<ReadState>(&Self::key(session_id)) {
            Ok(Some(state)) => state.with_cap(self.cap),
            Ok(None) => ReadState::new(self.cap),
            Err(e) => {
                warn!(session_id, error = %e, "Discarding unreadable read state");
                ReadState::new(self.cap)
            }
        }
    }

    pub fn contains(&self, session_id: &str, article_id: &str) -> bool {
        self.load(session_id).contains(article_id)
    }

    pub fn mark_read(&self, session_id: &str, article_id: &str) -> Result<()> {
        let mut state = self.load(session_id);
        if state.insert(article_id.to_string()) {
            self.storage.set_json(&Self::key(session_id), &state)?;
        }
        Ok(())
    }

    /// Move every id read under `from` into `to`. Returns the size of the
    /// resulting set.
    pub fn migrate(&self, from: &str, to: &str) -> Result<usize> {
        let source = self.load(from);
        let mut target = self.load(to);
        target.extend_from(&source);
        self.storage.set_json(&Self::key(to), &target)?;
        self.storage.remove(&Self::key(from))?;
        Ok(target.len())
    }
}
