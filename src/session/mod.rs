//! Session identity: one active session per signed-in user, mirrored by a
//! remote record and shared between tabs through client storage.

pub mod auth;
pub mod manager;

pub use auth::{AuthProvider, AuthState, AuthStatus, StaticAuth};
pub use manager::{SessionLifecycleManager, SessionTasks};

/// Storage key of the session descriptor.
pub const SESSION_KEY: &str = "session:descriptor";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Visible,
}

/// What a visibility change did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisibilityOutcome {
    NoSession,
    /// Timestamp recorded, nothing else to do.
    Recorded,
    /// Back within the soft expiration period; same session.
    Resumed,
    /// Hidden long enough to go stale: old record ended, new session started.
    Restarted { previous: String, current: String },
    /// Hidden past the hard logout age; left to the inactivity logout.
    Expired,
}
