pub mod client;
pub mod memory;
pub mod read_state;
pub mod sqlite;

use crate::app::Result;

pub use client::{ClientStorage, StorageChanges, StorageEvent, EXTERNAL_ORIGIN};
pub use memory::MemoryStore;
pub use read_state::ReadStateStore;
pub use sqlite::SqliteStore;

/// Durable client-side key-value storage.
pub trait Store {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;

    /// Opaque marker that changes whenever `key` is written, by anyone.
    /// `None` when the key is absent.
    fn revision(&self, key: &str) -> Result<Option<String>> {
        self.get(key)
    }
}
