use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

use crate::app::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Configuring,
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub status: AuthStatus,
    pub user_id: Option<String>,
}

impl AuthState {
    pub fn configuring() -> Self {
        Self {
            status: AuthStatus::Configuring,
            user_id: None,
        }
    }

    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            status: AuthStatus::Authenticated,
            user_id: Some(user_id.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            status: AuthStatus::Unauthenticated,
            user_id: None,
        }
    }

    /// The signed-in user, if any.
    pub fn user(&self) -> Option<&str> {
        match self.status {
            AuthStatus::Authenticated => self.user_id.as_deref(),
            _ => None,
        }
    }
}

/// Identity source. The current state is observed through a watch channel.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn state(&self) -> watch::Receiver<AuthState>;

    async fn sign_out(&self) -> Result<()>;
}

/// In-process provider driven by explicit `sign_in` / `sign_out` calls.
pub struct StaticAuth {
    tx: watch::Sender<AuthState>,
}

impl Default for StaticAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticAuth {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AuthState::configuring());
        Self { tx }
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let auth = Self::new();
        auth.sign_in(user_id);
        auth
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        self.tx.send_replace(AuthState::authenticated(user_id));
    }

    pub fn current(&self) -> AuthState {
        self.tx.borrow().clone()
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    fn state(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }

    async fn sign_out(&self) -> Result<()> {
        info!("Signed out");
        self.tx.send_replace(AuthState::unauthenticated());
        Ok(())
    }
}
