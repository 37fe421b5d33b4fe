//! Keeps the article store in step with the server.
//!
//! Push is the primary path. A shadow poll cross-checks it until one clean
//! diff after the first delivery; any gap or channel error abandons push for
//! interval polling.

pub mod engine;
pub mod state;

pub use engine::FeedSync;
pub use state::{SyncEvent, SyncState};
