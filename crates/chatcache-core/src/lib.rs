//! chatcache-core: local message cache and incremental sync engine
//!
//! This crate keeps a durable, deduplicated copy of a group-messaging
//! service's conversations and reconciles it against the remote API, either
//! from pages the UI already fetched or by scheduling a paged backfill.

pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod models;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod source;

pub use config::Config;
pub use db::Database;
pub use error::Error;
pub use error::Result;
pub use indexer::Indexer;
pub use scheduler::TaskScheduler;
pub use source::{HttpSource, MessageSource};

/// Application name used for config directories and paths.
pub const APP_NAME: &str = "chatcache";

/// Returns the environment variable prefix for this application.
pub fn env_prefix() -> String {
    "CHATCACHE".to_string()
}
