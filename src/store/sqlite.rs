use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};

use crate::app::{Result, WirefeedError};
use crate::store::Store;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let migrations = Migrations::new(vec![M::up(include_str!(
            "../../migrations/001-initial/up.sql"
        ))]);

        let mut conn = self.conn()?;

        migrations
            .to_latest(&mut conn)
            .map_err(|_| WirefeedError::Database(rusqlite::Error::InvalidQuery))?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            WirefeedError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some(e.to_string()),
            ))
        })
    }
}

impl Store for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;

        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(keys)
    }

    /// Write time of the row, so writes from other processes on the same
    /// file show up without comparing values.
    fn revision(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;

        let updated_at = conn
            .query_row(
                "SELECT updated_at FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("session:descriptor", "{}").unwrap();
        assert_eq!(
            store.get("session:descriptor").unwrap(),
            Some("{}".to_string())
        );
    }

    #[test]
    fn test_get_missing() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.get("nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_set_overwrites() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("k", "one").unwrap();
        store.set("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("two".to_string()));
        assert_eq!(store.keys().unwrap().len(), 1);
    }

    #[test]
    fn test_remove() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());

        // Removing a missing key is not an error
        store.remove("k").unwrap();
    }

    #[test]
    fn test_keys_sorted() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("b", "2").unwrap();
        store.set("a", "1").unwrap();
        store.set("c", "3").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_revision_tracks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirefeed.db");
        let first = SqliteStore::new(&path).unwrap();
        let second = SqliteStore::new(&path).unwrap();

        assert!(first.revision("k").unwrap().is_none());
        second.set("k", "v").unwrap();
        let written = first.revision("k").unwrap();
        assert!(written.is_some());

        std::thread::sleep(std::time::Duration::from_millis(2));
        second.set("k", "v").unwrap();
        assert_ne!(first.revision("k").unwrap(), written);

        second.remove("k").unwrap();
        assert!(first.revision("k").unwrap().is_none());
    }

    #[test]
    fn test_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wirefeed.db");

        {
            let store = SqliteStore::new(&path).unwrap();
            store.set("pref:language", "en").unwrap();
        }

        let reopened = SqliteStore::new(&path).unwrap();
        assert_eq!(
            reopened.get("pref:language").unwrap(),
            Some("en".to_string())
        );
    }
}
