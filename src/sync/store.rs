//! Storage traits used by the sync orchestrator.
//!
//! The orchestrator only talks to these traits, so any durable backend can
//! hold the queue. [`crate::persistence::Persistence`] implements both on top
//! of DuckDB.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::Result;
use crate::types::{ActionPayload, ActionType, Attachment, FailureKind, PendingAction};

/// Durable, time-ordered table of pending mutations.
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Persist a new action with `status = pending` and `retry_count = 0`.
    ///
    /// The record is durable once this returns. A storage failure is reported
    /// as [`crate::error::SyncError::Enqueue`].
    async fn enqueue(&self, action_type: ActionType, payload: ActionPayload)
        -> Result<PendingAction>;

    /// Full snapshot of every stored action, ascending by `created_at`.
    async fn list_ordered(&self) -> Result<Vec<PendingAction>>;

    async fn get(&self, id: &str) -> Result<Option<PendingAction>>;

    async fn mark_syncing(&self, id: &str) -> Result<()>;

    /// Record a failed attempt: `status = failed`, `retry_count += 1`,
    /// `last_error` and `failure_kind` replaced.
    async fn mark_failed(&self, id: &str, kind: FailureKind, error: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn count(&self) -> Result<u64>;

    /// Oldest action whose most recent attempt failed.
    async fn oldest_failure(&self) -> Result<Option<PendingAction>>;

    /// Attachment keys referenced by any queued action.
    async fn referenced_attachment_keys(&self) -> Result<HashSet<String>>;
}

/// Size-bounded store of binary blobs referenced by queued actions.
#[async_trait]
pub trait AttachmentCache: Send + Sync {
    /// Store or overwrite an entry, refreshing `cached_at`.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<Attachment>;

    async fn get(&self, key: &str) -> Result<Option<Attachment>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn entry_count(&self) -> Result<u64>;

    async fn total_bytes(&self) -> Result<u64>;

    /// Delete the oldest unreferenced entries until at most `limit` remain.
    ///
    /// Referenced entries are skipped, so the bound may stay exceeded when too
    /// many entries are still needed. Returns the evicted keys, oldest first.
    async fn evict_excess(
        &self,
        limit: usize,
        is_referenced: &(dyn for<'k> Fn(&'k str) -> bool + Send + Sync),
    ) -> Result<Vec<String>>;
}
