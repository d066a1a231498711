//! Remote dispatch table.
//!
//! Each [`ActionType`] maps to an [`ActionHandler`] that turns the queued
//! action into calls on the [`RemoteBackend`]. Every remote write is keyed by
//! the action id (row primary key, upload path), so delivering the same
//! action twice leaves the backend unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::backend::RemoteBackend;
use crate::config::BackendConfig;
use crate::error::{Result, SyncError};
use crate::types::{ActionType, Attachment};

pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
pub const STATUS_PENDING_APPROVAL: &str = "PENDING_APPROVAL";
pub const STATUS_BLOCKED: &str = "BLOCKED";

/// A queued action with its attachment reference already resolved.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub id: String,
    pub action_type: ActionType,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub attachment: Option<Attachment>,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, backend: &dyn RemoteBackend, action: &ResolvedAction) -> Result<()>;

    /// Whether this handler does something with an attachment on
    /// `action_type`. Actions carrying one are refused at enqueue otherwise.
    fn accepts_attachment(&self, action_type: &ActionType) -> bool {
        action_type.accepts_attachment()
    }
}

/// Remote table and bucket names used by the built-in handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMapping {
    pub records_table: String,
    pub tasks_table: String,
    pub evidence_table: String,
    pub progress_table: String,
    pub alerts_table: String,
    pub photos_table: String,
    pub attachments_bucket: String,
    pub photos_bucket: String,
    pub record_photo_field: String,
}

impl Default for BackendMapping {
    fn default() -> Self {
        Self::from(&BackendConfig::default())
    }
}

impl From<&BackendConfig> for BackendMapping {
    fn from(config: &BackendConfig) -> Self {
        Self {
            records_table: config.records_table.clone(),
            tasks_table: config.tasks_table.clone(),
            evidence_table: config.evidence_table.clone(),
            progress_table: config.progress_table.clone(),
            alerts_table: config.alerts_table.clone(),
            photos_table: config.photos_table.clone(),
            attachments_bucket: config.attachments_bucket.clone(),
            photos_bucket: config.photos_bucket.clone(),
            record_photo_field: config.record_photo_field.clone(),
        }
    }
}

pub struct DispatchTable {
    backend: Arc<dyn RemoteBackend>,
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl DispatchTable {
    /// Empty table; every action fails with [`SyncError::NoHandler`] until
    /// handlers are registered.
    pub fn new(backend: Arc<dyn RemoteBackend>) -> Self {
        Self {
            backend,
            handlers: HashMap::new(),
        }
    }

    /// Table with a handler for every built-in action type.
    pub fn standard(backend: Arc<dyn RemoteBackend>, mapping: BackendMapping) -> Self {
        let mut table = Self::new(backend);
        let handler: Arc<dyn ActionHandler> = Arc::new(StandardHandler::new(mapping));
        for action_type in ActionType::builtin() {
            table.register(action_type, handler.clone());
        }
        table
    }

    /// Add or replace the handler for `action_type`.
    pub fn register(&mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type, handler);
    }

    /// Route each configured action type to a server function.
    pub fn register_functions(&mut self, functions: &BTreeMap<String, String>) {
        for (action_type, function) in functions {
            debug!("Routing {} actions to function {}", action_type, function);
            self.register(
                ActionType::parse(action_type),
                Arc::new(FunctionHandler::new(function.clone())),
            );
        }
    }

    pub fn handles(&self, action_type: &ActionType) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Unregistered types fall back to the type's own rule; dispatch will
    /// fail them with [`SyncError::NoHandler`] either way.
    pub fn accepts_attachment(&self, action_type: &ActionType) -> bool {
        match self.handlers.get(action_type) {
            Some(handler) => handler.accepts_attachment(action_type),
            None => action_type.accepts_attachment(),
        }
    }

    pub fn backend(&self) -> Arc<dyn RemoteBackend> {
        self.backend.clone()
    }

    pub async fn dispatch(&self, action: &ResolvedAction) -> Result<()> {
        let handler = self
            .handlers
            .get(&action.action_type)
            .ok_or_else(|| SyncError::NoHandler(action.action_type.clone()))?;
        debug!("Dispatching {} action {}", action.action_type, action.id);
        handler.handle(self.backend.as_ref(), action).await
    }
}

/// Handler for the built-in field-work action types.
pub struct StandardHandler {
    mapping: BackendMapping,
}

impl StandardHandler {
    pub fn new(mapping: BackendMapping) -> Self {
        Self { mapping }
    }

    async fn upload(
        &self,
        backend: &dyn RemoteBackend,
        action: &ResolvedAction,
        attachment: &Attachment,
    ) -> Result<String> {
        let path = format!("{}/{}", action.id, attachment.key);
        backend
            .upload(
                &self.mapping.attachments_bucket,
                &path,
                &attachment.bytes,
                &attachment.content_type,
            )
            .await
    }

    /// Upload the attachment, if any, and return its URL as a field value.
    async fn upload_record_photo(
        &self,
        backend: &dyn RemoteBackend,
        action: &ResolvedAction,
    ) -> Result<Option<Value>> {
        match &action.attachment {
            Some(attachment) => {
                let url = self.upload(backend, action, attachment).await?;
                Ok(Some(Value::String(url)))
            }
            None => Ok(None),
        }
    }

    async fn sync_photo(&self, backend: &dyn RemoteBackend, action: &ResolvedAction) -> Result<()> {
        let attachment = action
            .attachment
            .as_ref()
            .ok_or_else(|| invalid(action, "an attachment is required"))?;
        let data = &action.data;
        let tree_id = required_str(action, "tree_id")?;
        let storage_path = optional_str(data, "storage_path")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/{}", action.id, attachment.key));

        backend
            .upload(
                &self.mapping.photos_bucket,
                &storage_path,
                &attachment.bytes,
                &attachment.content_type,
            )
            .await?;

        let metadata = data.get("metadata");
        let gps = |field: &str| {
            metadata
                .and_then(|m| m.get(field))
                .cloned()
                .unwrap_or(Value::Null)
        };
        let row = json!({
            "id": action.id,
            "tree_id": tree_id,
            "installation_id": data.get("installation_id").cloned().unwrap_or(Value::Null),
            "storage_path": storage_path,
            "filename": optional_str(data, "filename").unwrap_or(attachment.key.as_str()),
            "file_size": attachment.bytes.len(),
            "mime_type": attachment.content_type,
            "gps_latitude": gps("latitude"),
            "gps_longitude": gps("longitude"),
            "captured_at": optional_str(data, "captured_at")
                .map(str::to_string)
                .unwrap_or_else(|| action.created_at.to_rfc3339()),
            "uploaded_by": data.get("uploaded_by").cloned().unwrap_or(Value::Null),
            "display_order": data.get("display_order").cloned().unwrap_or(json!(0)),
        });
        backend.insert(&self.mapping.photos_table, &row).await
    }

    async fn insert_evidence(
        &self,
        backend: &dyn RemoteBackend,
        action: &ResolvedAction,
        photo_url: Option<String>,
        default_stage: &str,
    ) -> Result<()> {
        let data = &action.data;
        let (lat, lng) = location(data);
        let row = json!({
            "id": action.id,
            "task_id": required_str(action, "task_id")?,
            "stage": optional_str(data, "stage").unwrap_or(default_stage),
            "photo_url": photo_url.or_else(|| optional_str(data, "photo_url").map(str::to_string)),
            "photo_metadata": data.get("metadata").cloned().unwrap_or(Value::Null),
            "notes": data.get("notes").cloned().unwrap_or(Value::Null),
            "capture_lat": lat,
            "capture_lng": lng,
            "captured_at": action.created_at.to_rfc3339(),
        });
        backend.insert(&self.mapping.evidence_table, &row).await
    }

    async fn complete_task(&self, backend: &dyn RemoteBackend, action: &ResolvedAction) -> Result<()> {
        let task_id = required_str(action, "task_id")?;
        let mut patch = Map::new();
        patch.insert("status".into(), json!(STATUS_PENDING_APPROVAL));
        patch.insert("completed_at".into(), json!(action.created_at.to_rfc3339()));
        if let Some(progress) = action.data.get("progress") {
            patch.insert("progress_percent".into(), progress.clone());
        }
        if let Some(notes) = action.data.get("notes") {
            patch.insert("notes".into(), notes.clone());
        }
        backend
            .update(&self.mapping.tasks_table, task_id, &Value::Object(patch))
            .await
    }
}

#[async_trait]
impl ActionHandler for StandardHandler {
    async fn handle(&self, backend: &dyn RemoteBackend, action: &ResolvedAction) -> Result<()> {
        let mapping = &self.mapping;
        if action.attachment.is_some() && !action.action_type.accepts_attachment() {
            return Err(invalid(action, "this action type does not take an attachment"));
        }
        match &action.action_type {
            ActionType::CreateRecord => {
                let Value::Object(fields) = &action.data else {
                    return Err(invalid(action, "payload must be an object"));
                };
                let mut row = fields.clone();
                row.entry("id").or_insert_with(|| json!(action.id));
                if let Some(url) = self.upload_record_photo(backend, action).await? {
                    row.insert(mapping.record_photo_field.clone(), url);
                }
                backend.insert(&mapping.records_table, &Value::Object(row)).await
            }
            ActionType::UpdateRecord => {
                let id = required_str(action, "id")?;
                let Some(Value::Object(fields)) = action.data.get("data") else {
                    return Err(invalid(action, "missing object field 'data'"));
                };
                let mut patch = fields.clone();
                if let Some(url) = self.upload_record_photo(backend, action).await? {
                    patch.insert(mapping.record_photo_field.clone(), url);
                }
                backend
                    .update(&mapping.records_table, id, &Value::Object(patch))
                    .await
            }
            ActionType::DeleteRecord => {
                let id = required_str(action, "id")?;
                backend.delete(&mapping.records_table, id).await
            }
            ActionType::UploadAttachmentAndCompleteTask => {
                let attachment = action
                    .attachment
                    .as_ref()
                    .ok_or_else(|| invalid(action, "an attachment is required"))?;
                let url = self.upload(backend, action, attachment).await?;
                self.insert_evidence(backend, action, Some(url), "after")
                    .await?;
                self.complete_task(backend, action).await
            }
            ActionType::LogProgress => {
                let row = json!({
                    "id": action.id,
                    "task_id": required_str(action, "task_id")?,
                    "user_id": action.data.get("user_id").cloned().unwrap_or(Value::Null),
                    "progress_percent": action.data.get("percent").cloned().unwrap_or(Value::Null),
                    "notes": action.data.get("notes").cloned().unwrap_or(Value::Null),
                    "logged_at": action.created_at.to_rfc3339(),
                });
                backend.insert(&mapping.progress_table, &row).await
            }
            ActionType::StartTask => {
                let task_id = required_str(action, "task_id")?;
                let started_at = optional_str(&action.data, "started_at")
                    .map(str::to_string)
                    .unwrap_or_else(|| action.created_at.to_rfc3339());
                let patch = json!({
                    "status": STATUS_IN_PROGRESS,
                    "started_at": started_at,
                });
                backend.update(&mapping.tasks_table, task_id, &patch).await
            }
            ActionType::AddEvidence => {
                let url = match &action.attachment {
                    Some(attachment) => Some(self.upload(backend, action, attachment).await?),
                    None => None,
                };
                self.insert_evidence(backend, action, url, "during").await
            }
            ActionType::CreateAlert => {
                let (lat, lng) = location(&action.data);
                let row = json!({
                    "id": action.id,
                    "task_id": action.data.get("task_id").cloned().unwrap_or(Value::Null),
                    "user_id": action.data.get("user_id").cloned().unwrap_or(Value::Null),
                    "alert_type": required_str(action, "type")?,
                    "message": action.data.get("message").cloned().unwrap_or(Value::Null),
                    "location_lat": lat,
                    "location_lng": lng,
                });
                backend.insert(&mapping.alerts_table, &row).await
            }
            ActionType::CompleteTask => self.complete_task(backend, action).await,
            ActionType::BlockTask => {
                let task_id = required_str(action, "task_id")?;
                let patch = json!({
                    "status": STATUS_BLOCKED,
                    "notes": action.data.get("reason").cloned().unwrap_or(Value::Null),
                });
                backend.update(&mapping.tasks_table, task_id, &patch).await
            }
            ActionType::SyncPhoto => self.sync_photo(backend, action).await,
            ActionType::Custom(_) => Err(SyncError::NoHandler(action.action_type.clone())),
        }
    }
}

/// Forwards the action data to a named server function.
pub struct FunctionHandler {
    function: String,
}

impl FunctionHandler {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
        }
    }
}

#[async_trait]
impl ActionHandler for FunctionHandler {
    async fn handle(&self, backend: &dyn RemoteBackend, action: &ResolvedAction) -> Result<()> {
        if action.attachment.is_some() {
            return Err(invalid(action, "function actions do not take an attachment"));
        }
        let result = backend.invoke(&self.function, &action.data).await?;
        debug!("Function {} returned {}", self.function, result);
        Ok(())
    }

    fn accepts_attachment(&self, _action_type: &ActionType) -> bool {
        false
    }
}

fn invalid(action: &ResolvedAction, reason: &str) -> SyncError {
    SyncError::Dispatch(format!(
        "invalid {} payload for action {}: {}",
        action.action_type, action.id, reason
    ))
}

fn optional_str<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field).and_then(Value::as_str)
}

fn required_str<'a>(action: &'a ResolvedAction, field: &str) -> Result<&'a str> {
    optional_str(&action.data, field)
        .ok_or_else(|| invalid(action, &format!("missing string field '{}'", field)))
}

fn location(data: &Value) -> (Value, Value) {
    match data.get("location") {
        Some(loc) => (
            loc.get("latitude").cloned().unwrap_or(Value::Null),
            loc.get("longitude").cloned().unwrap_or(Value::Null),
        ),
        None => (Value::Null, Value::Null),
    }
}
