//! Data Module
//!
//! - feed: JSON-lines slice input (replay file or stdin)
//! - state: crash-recovery snapshot store (JSON file or SQLite)

pub mod feed;
pub mod state;

pub use feed::{spawn_feed, FeedSource, FeedStats};
pub use state::{open_store, PersistedState, StateStore};
