use std::path::PathBuf;
use std::sync::Arc;

use crate::app::error::{Result, WirefeedError};
use crate::articles::{ArticleStore, ReadStateBridge, SharedArticles, StoreLimits};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::session::{AuthProvider, SessionLifecycleManager};
use crate::store::{ClientStorage, SqliteStore};
use crate::transport::{HttpTransport, MemoryTransport, Transport};

pub struct AppContext {
    pub storage: ClientStorage,
    pub transport: Arc<dyn Transport>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

impl AppContext {
    /// SQLite-backed storage and the HTTP transport from config.
    pub fn new(config: Config, db_path: Option<PathBuf>) -> Result<Self> {
        let db_path = match db_path {
            Some(p) => p,
            None => Self::default_db_path()?,
        };

        let storage = ClientStorage::new(Arc::new(SqliteStore::new(&db_path)?));
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            &config.transport.endpoint,
            config.transport.request_timeout(),
        )?);

        Ok(Self {
            storage,
            transport,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Everything in memory, backed by an in-process transport.
    pub fn in_memory(config: Config) -> Self {
        Self::with_parts(
            ClientStorage::in_memory(),
            Arc::new(MemoryTransport::new()),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn with_parts(
        storage: ClientStorage,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            storage,
            transport,
            clock,
            config,
        }
    }

    pub fn session_manager(&self, auth: Arc<dyn AuthProvider>) -> SessionLifecycleManager {
        SessionLifecycleManager::new(
            self.storage.clone(),
            self.transport.clone(),
            auth,
            self.clock.clone(),
            self.config.session.clone(),
        )
    }

    /// An empty article store that consults the read state of whichever
    /// session the manager currently holds.
    pub fn article_store(&self, manager: &SessionLifecycleManager) -> SharedArticles {
        let bridge = ReadStateBridge::new(manager.read_state().clone(), manager.subscribe_session());
        SharedArticles::new(
            ArticleStore::new(StoreLimits::from(&self.config.feed), self.clock.clone())
                .with_read_state(bridge),
        )
    }

    fn default_db_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| WirefeedError::Config("Could not find data directory".into()))?;
        let wirefeed_dir = data_dir.join("wirefeed");
        std::fs::create_dir_all(&wirefeed_dir)?;
        Ok(wirefeed_dir.join("wirefeed.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StaticAuth;

    #[tokio::test]
    async fn test_article_store_follows_session_read_state() {
        let ctx = AppContext::in_memory(Config::default());
        let manager = ctx.session_manager(Arc::new(StaticAuth::signed_in("u1")));
        let articles = ctx.article_store(&manager);

        let session = manager.restore_or_start("u1").await.unwrap();
        manager.read_state().mark_read(&session.session_id, "a1").unwrap();

        let article = crate::domain::Article::new("a1", chrono::Utc::now());
        assert!(articles.lock().add(article));
        assert!(articles.lock().get("a1").unwrap().seen);
    }

    #[test]
    fn test_sqlite_context_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(Config::default(), Some(dir.path().join("test.db"))).unwrap();
        ctx.storage.set("pref:theme", "dark").unwrap();
        assert_eq!(ctx.storage.get("pref:theme").unwrap(), Some("dark".into()));
    }
}
