//! Core data model: queued actions, cached attachments and sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The kind of mutation a queued action performs against the remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ActionType {
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
    UploadAttachmentAndCompleteTask,
    LogProgress,
    StartTask,
    AddEvidence,
    CreateAlert,
    CompleteTask,
    BlockTask,
    /// Upload a photo and record it against a tree.
    SyncPhoto,
    /// Deployment-specific action type; needs a handler registered on the
    /// dispatch table.
    Custom(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            ActionType::CreateRecord => "create-record",
            ActionType::UpdateRecord => "update-record",
            ActionType::DeleteRecord => "delete-record",
            ActionType::UploadAttachmentAndCompleteTask => "upload-attachment-and-complete-task",
            ActionType::LogProgress => "log-progress",
            ActionType::StartTask => "start-task",
            ActionType::AddEvidence => "add-evidence",
            ActionType::CreateAlert => "create-alert",
            ActionType::CompleteTask => "complete-task",
            ActionType::BlockTask => "block-task",
            ActionType::SyncPhoto => "sync-photo",
            ActionType::Custom(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().replace('_', "-").as_str() {
            "create-record" => ActionType::CreateRecord,
            "update-record" => ActionType::UpdateRecord,
            "delete-record" => ActionType::DeleteRecord,
            "upload-attachment-and-complete-task" => ActionType::UploadAttachmentAndCompleteTask,
            "log-progress" => ActionType::LogProgress,
            "start-task" => ActionType::StartTask,
            "add-evidence" => ActionType::AddEvidence,
            "create-alert" => ActionType::CreateAlert,
            "complete-task" => ActionType::CompleteTask,
            "block-task" => ActionType::BlockTask,
            "sync-photo" => ActionType::SyncPhoto,
            _ => ActionType::Custom(s.to_string()),
        }
    }

    /// All built-in action types, in declaration order.
    pub fn builtin() -> [ActionType; 11] {
        [
            ActionType::CreateRecord,
            ActionType::UpdateRecord,
            ActionType::DeleteRecord,
            ActionType::UploadAttachmentAndCompleteTask,
            ActionType::LogProgress,
            ActionType::StartTask,
            ActionType::AddEvidence,
            ActionType::CreateAlert,
            ActionType::CompleteTask,
            ActionType::BlockTask,
            ActionType::SyncPhoto,
        ]
    }

    /// Whether a payload of this type may reference a cached attachment.
    /// Custom types are left to their registered handler.
    pub fn accepts_attachment(&self) -> bool {
        matches!(
            self,
            ActionType::CreateRecord
                | ActionType::UpdateRecord
                | ActionType::UploadAttachmentAndCompleteTask
                | ActionType::AddEvidence
                | ActionType::SyncPhoto
                | ActionType::Custom(_)
        )
    }

    pub fn requires_attachment(&self) -> bool {
        matches!(
            self,
            ActionType::UploadAttachmentAndCompleteTask | ActionType::SyncPhoto
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ActionType {
    fn from(s: String) -> Self {
        ActionType::parse(&s)
    }
}

impl From<ActionType> for String {
    fn from(t: ActionType) -> Self {
        t.as_str().to_string()
    }
}

/// Lifecycle status of a queued action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Syncing,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Syncing => "syncing",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "syncing" => Some(ActionStatus::Syncing),
            "failed" => Some(ActionStatus::Failed),
            _ => None,
        }
    }
}

/// Why the most recent dispatch attempt of an action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Network or server error; retried on the next drain.
    Dispatch,
    /// The referenced attachment is gone from the cache. The action stays
    /// queued but cannot succeed until the attachment is captured again.
    MissingAttachment,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Dispatch => "dispatch",
            FailureKind::MissingAttachment => "missing-attachment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatch" => Some(FailureKind::Dispatch),
            "missing-attachment" => Some(FailureKind::MissingAttachment),
            _ => None,
        }
    }
}

/// Action-specific data plus an optional reference to a cached attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPayload {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

impl ActionPayload {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            attachment: None,
        }
    }

    /// Reference a cached attachment by its stable key.
    pub fn with_attachment(mut self, key: impl Into<String>) -> Self {
        self.attachment = Some(key.into());
        self
    }
}

/// A queued mutation awaiting remote application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: String,
    pub action_type: ActionType,
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PendingAction {
    /// True when the last attempt failed because the attachment was evicted
    /// or never captured.
    pub fn needs_recapture(&self) -> bool {
        self.failure_kind == Some(FailureKind::MissingAttachment)
    }
}

/// A cached binary blob, usually a photo.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub cached_at: DateTime<Utc>,
}

/// User-observable sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending_count: u64,
    pub is_syncing: bool,
    pub is_online: bool,
}
