use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

pub const DEFAULT_READ_STATE_CAP: usize = 1000;

/// Ids of articles read during one session, oldest first.
///
/// Bounded; inserting past the cap evicts the oldest id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ReadState {
    ids: VecDeque<String>,
    cap: usize,
}

impl ReadState {
    pub fn new(cap: usize) -> Self {
        Self {
            ids: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I, cap: usize) -> Self {
        let mut state = Self::new(cap);
        for id in ids {
            state.insert(id);
        }
        state
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self.evict();
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    /// Returns false if the id was already present.
    pub fn insert(&mut self, id: String) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.ids.push_back(id);
        self.evict();
        true
    }

    /// Append every id of `other` that is not already present.
    pub fn extend_from(&mut self, other: &ReadState) {
        for id in &other.ids {
            self.insert(id.clone());
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn evict(&mut self) {
        while self.ids.len() > self.cap {
            self.ids.pop_front();
        }
    }
}

impl Default for ReadState {
    fn default() -> Self {
        Self::new(DEFAULT_READ_STATE_CAP)
    }
}

/// Decoded sets are uncapped until [`ReadState::with_cap`] applies the
/// configured bound.
impl From<Vec<String>> for ReadState {
    fn from(ids: Vec<String>) -> Self {
        Self::from_ids(ids, usize::MAX)
    }
}

impl From<ReadState> for Vec<String> {
    fn from(state: ReadState) -> Self {
        state.ids.into()
    }
}
