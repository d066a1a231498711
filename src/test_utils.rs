//! Test doubles shared by unit and integration tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::backend::RemoteBackend;
use crate::error::{Result, SyncError};
use crate::sync::dispatch::{ActionHandler, ResolvedAction};
use crate::sync::store::ActionStore;
use crate::types::{ActionPayload, ActionType, FailureKind, PendingAction};

/// One call received by [`MockBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Insert {
        table: String,
        row: Value,
    },
    Update {
        table: String,
        id: String,
        patch: Value,
    },
    Delete {
        table: String,
        id: String,
    },
    Invoke {
        function: String,
        payload: Value,
    },
    Upload {
        bucket: String,
        path: String,
        bytes: Vec<u8>,
        content_type: String,
    },
}

type CallFilter = Box<dyn Fn(&BackendCall) -> bool + Send + Sync>;

/// In-memory backend that records every call and fails on request.
pub struct MockBackend {
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<Vec<(CallFilter, String)>>,
    reachable: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// Reject calls matching `filter` with `message` until cleared.
    pub fn fail_when(
        &self,
        filter: impl Fn(&BackendCall) -> bool + Send + Sync + 'static,
        message: &str,
    ) {
        self.failures
            .lock()
            .unwrap()
            .push((Box::new(filter), message.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Successful calls, in arrival order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        let failures = self.failures.lock().unwrap();
        if let Some((_, message)) = failures.iter().find(|(filter, _)| filter(&call)) {
            return Err(SyncError::Dispatch(message.clone()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for MockBackend {
    async fn insert(&self, table: &str, row: &Value) -> Result<()> {
        self.record(BackendCall::Insert {
            table: table.to_string(),
            row: row.clone(),
        })
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<()> {
        self.record(BackendCall::Update {
            table: table.to_string(),
            id: id.to_string(),
            patch: patch.clone(),
        })
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.record(BackendCall::Delete {
            table: table.to_string(),
            id: id.to_string(),
        })
    }

    async fn invoke(&self, function: &str, payload: &Value) -> Result<Value> {
        self.record(BackendCall::Invoke {
            function: function.to_string(),
            payload: payload.clone(),
        })?;
        Ok(Value::Null)
    }

    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String> {
        self.record(BackendCall::Upload {
            bucket: bucket.to_string(),
            path: path.to_string(),
            bytes: bytes.to_vec(),
            content_type: content_type.to_string(),
        })?;
        Ok(format!("mock://{}/{}", bucket, path))
    }

    async fn ping(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Backend {
                status: 503,
                message: "unreachable".to_string(),
            })
        }
    }
}

type ActionFilter = Box<dyn Fn(&ResolvedAction) -> Option<String> + Send + Sync>;

/// Dispatch handler that records the actions it sees.
///
/// With [`RecordingHandler::gated`] every call signals `entered` and then
/// blocks until `release` is notified, which lets tests hold a drain open.
pub struct RecordingHandler {
    seen: Mutex<Vec<ResolvedAction>>,
    failure: Option<ActionFilter>,
    gate: Option<(Notify, Notify)>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            failure: None,
            gate: None,
        }
    }

    /// Fail every action for which `filter` returns an error message.
    pub fn failing(filter: impl Fn(&ResolvedAction) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            failure: Some(Box::new(filter)),
            ..Self::new()
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some((Notify::new(), Notify::new())),
            ..Self::new()
        }
    }

    /// Wait until a gated call has started.
    pub async fn entered(&self) {
        if let Some((entered, _)) = &self.gate {
            entered.notified().await;
        }
    }

    /// Let one gated call finish.
    pub fn release(&self) {
        if let Some((_, release)) = &self.gate {
            release.notify_one();
        }
    }

    pub fn seen(&self) -> Vec<ResolvedAction> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_ids(&self) -> Vec<String> {
        self.seen().into_iter().map(|a| a.id).collect()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    async fn handle(&self, _backend: &dyn RemoteBackend, action: &ResolvedAction) -> Result<()> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        self.seen.lock().unwrap().push(action.clone());
        if let Some(filter) = &self.failure {
            if let Some(message) = filter(action) {
                return Err(SyncError::Dispatch(message));
            }
        }
        Ok(())
    }
}

/// Queue write that [`FailingStore`] can be told to reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    MarkSyncing,
    MarkFailed,
    Remove,
}

/// [`ActionStore`] wrapper that fails chosen writes for chosen actions and
/// passes everything else through.
pub struct FailingStore {
    inner: Arc<dyn ActionStore>,
    failures: Mutex<Vec<(StoreOp, String)>>,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn ActionStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, op: StoreOp, id: &str) {
        self.failures.lock().unwrap().push((op, id.to_string()));
    }

    fn check(&self, op: StoreOp, id: &str) -> Result<()> {
        let failures = self.failures.lock().unwrap();
        if failures.iter().any(|(o, i)| *o == op && i == id) {
            return Err(SyncError::Internal(format!("{:?} failed for {}", op, id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ActionStore for FailingStore {
    async fn enqueue(&self, action_type: ActionType, payload: ActionPayload) -> Result<PendingAction> {
        self.inner.enqueue(action_type, payload).await
    }

    async fn list_ordered(&self) -> Result<Vec<PendingAction>> {
        self.inner.list_ordered().await
    }

    async fn get(&self, id: &str) -> Result<Option<PendingAction>> {
        self.inner.get(id).await
    }

    async fn mark_syncing(&self, id: &str) -> Result<()> {
        self.check(StoreOp::MarkSyncing, id)?;
        self.inner.mark_syncing(id).await
    }

    async fn mark_failed(&self, id: &str, kind: FailureKind, error: &str) -> Result<()> {
        self.check(StoreOp::MarkFailed, id)?;
        self.inner.mark_failed(id, kind, error).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.check(StoreOp::Remove, id)?;
        self.inner.remove(id).await
    }

    async fn count(&self) -> Result<u64> {
        self.inner.count().await
    }

    async fn oldest_failure(&self) -> Result<Option<PendingAction>> {
        self.inner.oldest_failure().await
    }

    async fn referenced_attachment_keys(&self) -> Result<HashSet<String>> {
        self.inner.referenced_attachment_keys().await
    }
}
