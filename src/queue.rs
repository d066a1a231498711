//! UI-facing entry point to the offline queue.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::RemoteBackend;
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::persistence::Persistence;
use crate::sync::{
    ActionStore, AttachmentCache, BackendMapping, ConnectivityMonitor, DispatchTable, DrainOutcome,
    RetryPolicy, StatusReporter, SyncOrchestrator,
};
use crate::types::{ActionPayload, ActionType, Attachment, PendingAction, SyncStatus};

pub struct OfflineQueue {
    actions: Arc<dyn ActionStore>,
    attachments: Arc<dyn AttachmentCache>,
    orchestrator: Arc<SyncOrchestrator>,
    status: StatusReporter,
    cache_limit: usize,
    /// Serializes enqueue against capture so eviction never sees a
    /// reference set that misses an action being queued.
    writes: Mutex<()>,
}

impl OfflineQueue {
    /// Queue backed by `persistence` with the built-in handlers, any
    /// configured server functions, and the retry and cache settings from
    /// `config`.
    pub fn new(persistence: Persistence, backend: Arc<dyn RemoteBackend>, config: &AppConfig) -> Self {
        let mut dispatch = DispatchTable::standard(backend, BackendMapping::from(&config.backend));
        dispatch.register_functions(&config.backend.functions);
        Self::from_parts(
            Arc::new(persistence.clone()),
            Arc::new(persistence),
            dispatch,
            RetryPolicy::from(&config.sync.retry),
            config.cache.max_entries,
        )
    }

    pub fn from_parts(
        actions: Arc<dyn ActionStore>,
        attachments: Arc<dyn AttachmentCache>,
        dispatch: DispatchTable,
        retry: RetryPolicy,
        cache_limit: usize,
    ) -> Self {
        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                actions.clone(),
                attachments.clone(),
                dispatch,
                Arc::new(ConnectivityMonitor::new()),
            )
            .with_retry_policy(retry),
        );
        let status = StatusReporter::new(actions.clone(), orchestrator.clone());
        Self {
            actions,
            attachments,
            orchestrator,
            status,
            cache_limit,
            writes: Mutex::new(()),
        }
    }

    /// Durably record a user action. A referenced attachment must already be
    /// captured, and only types that upload attachments may carry one.
    pub async fn enqueue(
        &self,
        action_type: ActionType,
        payload: ActionPayload,
    ) -> Result<PendingAction> {
        match &payload.attachment {
            Some(key) if !self.orchestrator.dispatch_table().accepts_attachment(&action_type) => {
                return Err(SyncError::Enqueue(format!(
                    "{} actions do not take an attachment (got '{}')",
                    action_type, key
                )));
            }
            None if action_type.requires_attachment() => {
                return Err(SyncError::Enqueue(format!(
                    "{} actions require an attachment",
                    action_type
                )));
            }
            _ => {}
        }

        let _writes = self.writes.lock().await;
        if let Some(key) = &payload.attachment {
            if self.attachments.get(key).await?.is_none() {
                return Err(SyncError::Enqueue(format!(
                    "attachment '{}' has not been captured",
                    key
                )));
            }
        }
        let action = self.actions.enqueue(action_type, payload).await?;
        debug!("Queued {} action {}", action.action_type, action.id);
        Ok(action)
    }

    /// Store an attachment under `key`, then trim the cache back to its bound
    /// without touching anything a queued action still needs.
    pub async fn capture_attachment(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<Attachment> {
        let _writes = self.writes.lock().await;
        let attachment = self.attachments.put(key, bytes, content_type).await?;

        let referenced = self.actions.referenced_attachment_keys().await?;
        let is_referenced = |candidate: &str| candidate == key || referenced.contains(candidate);
        match self
            .attachments
            .evict_excess(self.cache_limit, &is_referenced)
            .await
        {
            Ok(evicted) if !evicted.is_empty() => {
                debug!("Evicted {} cached attachments", evicted.len())
            }
            Ok(_) => {}
            Err(e) => warn!("Attachment cache eviction failed: {}", e),
        }
        Ok(attachment)
    }

    pub async fn sync_now(&self) -> DrainOutcome {
        self.orchestrator.sync_now().await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        self.status.snapshot().await
    }

    pub async fn oldest_failure(&self) -> Result<Option<PendingAction>> {
        self.status.oldest_failure().await
    }

    /// Feed the platform's connectivity signal.
    pub fn set_online(&self, online: bool) {
        self.orchestrator.connectivity().observe(online);
    }

    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn actions(&self) -> Arc<dyn ActionStore> {
        self.actions.clone()
    }

    pub fn attachments(&self) -> Arc<dyn AttachmentCache> {
        self.attachments.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{BackendCall, MockBackend};
    use serde_json::json;

    fn queue_with_limit(limit: usize) -> (OfflineQueue, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let mut config = AppConfig::default();
        config.cache.max_entries = limit;
        let persistence = Persistence::in_memory().expect("persistence");
        (OfflineQueue::new(persistence, backend.clone(), &config), backend)
    }

    #[tokio::test]
    async fn enqueue_rejects_uncaptured_attachment() {
        let (queue, _) = queue_with_limit(10);
        let err = queue
            .enqueue(
                ActionType::AddEvidence,
                ActionPayload::new(json!({"task_id": "t1"})).with_attachment("photo-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Enqueue(_)));
        assert_eq!(queue.status().await.unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn enqueue_enforces_attachment_rules() {
        let (queue, _) = queue_with_limit(10);
        queue
            .capture_attachment("photo-1", vec![1], "image/jpeg")
            .await
            .unwrap();

        let err = queue
            .enqueue(
                ActionType::StartTask,
                ActionPayload::new(json!({"task_id": "t1"})).with_attachment("photo-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Enqueue(_)), "{:?}", err);

        let err = queue
            .enqueue(ActionType::SyncPhoto, ActionPayload::new(json!({"tree_id": "tree-9"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Enqueue(_)), "{:?}", err);

        queue
            .enqueue(
                ActionType::CreateRecord,
                ActionPayload::new(json!({"name": "Tree-001"})).with_attachment("photo-1"),
            )
            .await
            .expect("record with photo");
        assert_eq!(queue.status().await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn configured_function_actions_reach_the_backend() {
        let backend = Arc::new(MockBackend::new());
        let mut config = AppConfig::default();
        config
            .backend
            .functions
            .insert("cancel-work-order".to_string(), "cancel_work_order".to_string());
        let queue = OfflineQueue::new(
            Persistence::in_memory().expect("persistence"),
            backend.clone(),
            &config,
        );

        queue
            .capture_attachment("photo-1", vec![1], "image/jpeg")
            .await
            .unwrap();
        let err = queue
            .enqueue(
                ActionType::parse("cancel-work-order"),
                ActionPayload::new(json!({"order_id": "wo-3"})).with_attachment("photo-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Enqueue(_)));

        queue
            .enqueue(
                ActionType::parse("cancel-work-order"),
                ActionPayload::new(json!({"order_id": "wo-3"})),
            )
            .await
            .unwrap();
        assert!(matches!(queue.sync_now().await, DrainOutcome::Completed(r) if r.succeeded == 1));
        assert_eq!(
            backend.calls(),
            vec![BackendCall::Invoke {
                function: "cancel_work_order".to_string(),
                payload: json!({"order_id": "wo-3"}),
            }]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_capture_never_evicts_a_queued_attachment() {
        let (queue, _) = queue_with_limit(1);
        let queue = Arc::new(queue);

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20 {
            let queue = queue.clone();
            tasks.spawn(async move {
                let key = format!("photo-{}", i);
                queue
                    .capture_attachment(&key, vec![i as u8], "image/jpeg")
                    .await
                    .unwrap();
                // Another capture may evict the key before it is referenced.
                let _ = queue
                    .enqueue(
                        ActionType::AddEvidence,
                        ActionPayload::new(json!({"task_id": "t1"})).with_attachment(key),
                    )
                    .await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let queued = queue.actions().list_ordered().await.unwrap();
        assert!(!queued.is_empty());
        let cache = queue.attachments();
        for action in queued {
            let key = action.payload.attachment.expect("attachment key");
            assert!(
                cache.get(&key).await.unwrap().is_some(),
                "attachment {} of queued action {} was evicted",
                key,
                action.id
            );
        }
    }

    #[tokio::test]
    async fn capture_keeps_cache_bounded() {
        let (queue, _) = queue_with_limit(2);
        for key in ["a", "b", "c"] {
            queue
                .capture_attachment(key, vec![1], "image/jpeg")
                .await
                .unwrap();
        }
        let cache = queue.attachments();
        assert_eq!(cache.entry_count().await.unwrap(), 2);
        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn capture_never_evicts_referenced_attachment() {
        let (queue, _) = queue_with_limit(1);
        queue
            .capture_attachment("before", vec![1], "image/jpeg")
            .await
            .unwrap();
        queue
            .enqueue(
                ActionType::AddEvidence,
                ActionPayload::new(json!({"task_id": "t1"})).with_attachment("before"),
            )
            .await
            .unwrap();
        queue
            .capture_attachment("after", vec![2], "image/jpeg")
            .await
            .unwrap();

        let cache = queue.attachments();
        assert!(cache.get("before").await.unwrap().is_some());
        assert!(cache.get("after").await.unwrap().is_some());
        assert_eq!(cache.entry_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn set_online_controls_manual_sync() {
        let (queue, backend) = queue_with_limit(10);
        queue
            .enqueue(ActionType::CreateRecord, ActionPayload::new(json!({"name": "Tree-001"})))
            .await
            .unwrap();

        queue.set_online(false);
        assert_eq!(queue.sync_now().await, DrainOutcome::Offline);
        assert!(!queue.status().await.unwrap().is_online);

        queue.set_online(true);
        assert!(matches!(queue.sync_now().await, DrainOutcome::Completed(r) if r.succeeded == 1));
        assert_eq!(backend.calls().len(), 1);
        assert_eq!(queue.status().await.unwrap().pending_count, 0);
    }
}
