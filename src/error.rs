//! Error types for the offline queue and sync engine.

use crate::types::ActionType;

/// Errors raised by the action store, attachment cache, dispatch table and
/// remote backend.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to record action: {0}")]
    Enqueue(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] duckdb::Error),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("No handler registered for action type: {0}")]
    NoHandler(ActionType),

    #[error("Attachment '{key}' referenced by action {action_id} is missing from the cache")]
    MissingAttachment { action_id: String, key: String },

    #[error("Backend rejected request ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether retrying the same action later can plausibly succeed without
    /// user intervention.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SyncError::MissingAttachment { .. })
    }

    /// Message stored as an action's `last_error`: the bare reason for
    /// dispatch failures, the full display text otherwise.
    pub fn detail(&self) -> String {
        match self {
            SyncError::Dispatch(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
