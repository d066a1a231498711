//! Offline-first mutation queue for field data collection.
//!
//! User actions are written to a durable local queue first and replayed
//! against the remote backend, oldest first, whenever connectivity allows.
//! Photos and other attachments live in a size-bounded local cache until
//! the actions that reference them have synced.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod persistence;
pub mod queue;
pub mod sync;
pub mod test_utils;
pub mod types;

pub use error::{Result, SyncError};
pub use queue::OfflineQueue;
