//! # Wirefeed
//!
//! Client core for a live news feed: reliable article delivery over an
//! unreliable push channel, plus session tracking across tabs.
//!
//! ## Architecture
//!
//! ```text
//! Auth → Session → FeedSync → Normalizer → ArticleStore → UI
//!                      ↑
//!            push + shadow poll / polling
//! ```
//!
//! - [`sync`]: push subscription verified by a shadow poll, polling fallback
//! - [`articles`]: priority-ordered, capacity-bounded live store
//! - [`session`]: session restore, restart and expiry, cross-tab reconciliation
//! - [`inactivity`]: idle warning and logout timer
//!
//! ## Quick Start
//!
//! ```bash
//! # Follow the feed as a user
//! wirefeed run --user alice
//!
//! # Show the stored session
//! wirefeed session
//!
//! # End it
//! wirefeed logout
//! ```

/// Application context and error handling.
///
/// The [`AppContext`](app::AppContext) struct wires together storage,
/// transport, clock and configuration.
pub mod app;

/// Article store: ordering, capacity trimming and the seen cache.
pub mod articles;

/// Command-line interface using clap.
///
/// - `run --user <id>` - Sign in and follow the feed
/// - `articles` - Fetch and list the current articles once
/// - `sweep --user <id>` - Expire abandoned sessions
/// - `session` - Show the stored session
/// - `logout` - End the stored session
pub mod cli;

/// Wall-clock abstraction so session timing can be driven in tests.
pub mod clock;

/// Configuration loaded from `~/.config/wirefeed/config.toml`.
pub mod config;

/// Supervisor that runs sessions and the feed engine per signed-in user.
pub mod daemon;

/// Core domain models.
///
/// - [`Article`](domain::Article) and [`RawArticle`](domain::RawArticle)
/// - [`SessionDescriptor`](domain::SessionDescriptor) and session records
/// - [`ReadState`](domain::ReadState): per-session read ids
pub mod domain;

/// Inactivity warning and logout timer.
pub mod inactivity;

/// Converts wire articles into [`Article`](domain::Article)s.
///
/// Entity maps may arrive as JSON strings or objects; malformed ones are
/// dropped rather than failing the batch.
pub mod normalizer;

/// Session lifecycle and auth provider seam.
pub mod session;

/// Key-value persistence.
///
/// - [`Store`](store::Store): Trait defining storage operations
/// - [`SqliteStore`](store::SqliteStore): SQLite implementation
/// - [`ClientStorage`](store::ClientStorage): tab-aware handle with change events
pub mod store;

/// Feed sync engine.
pub mod sync;

/// Backend seam: article fetch and push, session records.
pub mod transport;
