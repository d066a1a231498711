use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

use fieldsync::config::AppConfig;
use fieldsync::persistence::Persistence;
use fieldsync::sync::{
    ActionStore, AttachmentCache, DispatchTable, DrainOutcome, DrainReport, RetryPolicy,
};
use fieldsync::test_utils::{BackendCall, MockBackend, RecordingHandler};
use fieldsync::types::{ActionPayload, ActionStatus, ActionType};
use fieldsync::OfflineQueue;

fn recording_queue(persistence: &Persistence, handler: Arc<RecordingHandler>) -> OfflineQueue {
    let mut dispatch = DispatchTable::new(Arc::new(MockBackend::new()));
    for action_type in ActionType::builtin() {
        dispatch.register(action_type, handler.clone());
    }
    OfflineQueue::from_parts(
        Arc::new(persistence.clone()),
        Arc::new(persistence.clone()),
        dispatch,
        RetryPolicy::flat(),
        10,
    )
}

fn report(outcome: DrainOutcome) -> DrainReport {
    match outcome {
        DrainOutcome::Completed(report) => report,
        other => panic!("expected a completed drain, got {:?}", other),
    }
}

#[tokio::test]
async fn single_action_is_delivered_with_its_id() {
    let persistence = Persistence::in_memory().expect("persistence");
    let handler = Arc::new(RecordingHandler::new());
    let queue = recording_queue(&persistence, handler.clone());

    let action = queue
        .enqueue(
            ActionType::CreateRecord,
            ActionPayload::new(json!({"name": "Tree-001"})),
        )
        .await
        .unwrap();
    assert_eq!(queue.status().await.unwrap().pending_count, 1);

    report(queue.sync_now().await);

    assert_eq!(queue.status().await.unwrap().pending_count, 0);
    assert_eq!(handler.seen_ids(), vec![action.id]);
}

#[tokio::test]
async fn failed_middle_action_stays_queued() {
    let persistence = Persistence::in_memory().expect("persistence");
    let handler = Arc::new(RecordingHandler::failing(|action| {
        (action.data["t"] == 2).then(|| "network timeout".to_string())
    }));
    let queue = recording_queue(&persistence, handler);

    let mut queued = Vec::new();
    for t in 1..=3 {
        queued.push(
            queue
                .enqueue(ActionType::LogProgress, ActionPayload::new(json!({ "t": t })))
                .await
                .unwrap(),
        );
    }

    let drained = report(queue.sync_now().await);
    assert_eq!(drained.succeeded, 2);
    assert_eq!(drained.failed, 1);

    let remaining = persistence.list_ordered().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, queued[1].id);
    assert_eq!(remaining[0].created_at, queued[1].created_at);
    assert_eq!(remaining[0].retry_count, 1);
    assert_eq!(remaining[0].status, ActionStatus::Failed);
    assert_eq!(remaining[0].last_error.as_deref(), Some("network timeout"));

    let failure = queue.oldest_failure().await.unwrap().expect("failure");
    assert_eq!(failure.id, queued[1].id);
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("queue.duckdb");
    let handler = Arc::new(RecordingHandler::new());

    let ids: Vec<String> = {
        let persistence = Persistence::new(&path).expect("persistence");
        let queue = recording_queue(&persistence, handler.clone());
        queue
            .capture_attachment("photo-1", vec![9, 9, 9], "image/jpeg")
            .await
            .unwrap();
        let mut ids = Vec::new();
        ids.push(
            queue
                .enqueue(
                    ActionType::StartTask,
                    ActionPayload::new(json!({"task_id": "task-7"})),
                )
                .await
                .unwrap()
                .id,
        );
        ids.push(
            queue
                .enqueue(
                    ActionType::UploadAttachmentAndCompleteTask,
                    ActionPayload::new(json!({"task_id": "task-7"})).with_attachment("photo-1"),
                )
                .await
                .unwrap()
                .id,
        );
        ids
    };

    let persistence = Persistence::new(&path).expect("reopen");
    let queue = recording_queue(&persistence, handler.clone());
    assert_eq!(queue.status().await.unwrap().pending_count, 2);

    report(queue.sync_now().await);
    assert_eq!(handler.seen_ids(), ids);
    let seen = handler.seen();
    let attachment = seen[1].attachment.as_ref().expect("attachment survived");
    assert_eq!(attachment.bytes, vec![9, 9, 9]);
}

#[tokio::test]
async fn end_to_end_against_mock_backend() {
    let persistence = Persistence::in_memory().expect("persistence");
    let backend = Arc::new(MockBackend::new());
    let queue = OfflineQueue::new(persistence.clone(), backend.clone(), &AppConfig::default());

    queue
        .capture_attachment("after-photo", vec![1, 2, 3, 4], "image/jpeg")
        .await
        .unwrap();
    let complete = queue
        .enqueue(
            ActionType::UploadAttachmentAndCompleteTask,
            ActionPayload::new(json!({"task_id": "task-7", "notes": "stump ground"}))
                .with_attachment("after-photo"),
        )
        .await
        .unwrap();

    queue.set_online(false);
    assert_eq!(queue.sync_now().await, DrainOutcome::Offline);
    assert_eq!(queue.status().await.unwrap().pending_count, 1);

    queue.set_online(true);
    let drained = report(queue.sync_now().await);
    assert_eq!(drained.succeeded, 1);

    let calls = backend.calls();
    assert_eq!(calls.len(), 3);
    assert!(matches!(
        &calls[0],
        BackendCall::Upload { path, .. } if *path == format!("{}/after-photo", complete.id)
    ));
    assert!(matches!(&calls[1], BackendCall::Insert { table, .. } if table == "task_evidence"));
    assert!(matches!(&calls[2], BackendCall::Update { id, .. } if id == "task-7"));

    // The attachment is no longer referenced and may now be evicted.
    assert!(persistence.referenced_attachment_keys().await.unwrap().is_empty());
    assert_eq!(
        persistence.evict_excess(0, &|_: &str| false).await.unwrap(),
        vec!["after-photo".to_string()]
    );
}

#[tokio::test]
async fn evicted_attachment_surfaces_for_recapture() {
    let persistence = Persistence::in_memory().expect("persistence");
    let handler = Arc::new(RecordingHandler::new());
    let queue = recording_queue(&persistence, handler.clone());

    queue
        .capture_attachment("photo-1", vec![1], "image/jpeg")
        .await
        .unwrap();
    let action = queue
        .enqueue(
            ActionType::AddEvidence,
            ActionPayload::new(json!({"task_id": "task-7"})).with_attachment("photo-1"),
        )
        .await
        .unwrap();
    // Lost outside the queue's control, e.g. storage cleared by the platform.
    persistence.delete("photo-1").await.unwrap();

    let drained = report(queue.sync_now().await);
    assert_eq!(drained.missing_attachments, 1);
    assert!(handler.seen().is_empty());

    let failure = queue.oldest_failure().await.unwrap().expect("failure");
    assert_eq!(failure.id, action.id);
    assert!(failure.needs_recapture());

    queue
        .capture_attachment("photo-1", vec![2], "image/jpeg")
        .await
        .unwrap();
    assert_eq!(report(queue.sync_now().await).succeeded, 1);
    assert_eq!(queue.status().await.unwrap().pending_count, 0);
}

#[tokio::test]
async fn record_photo_reaches_the_backend() {
    let persistence = Persistence::in_memory().expect("persistence");
    let backend = Arc::new(MockBackend::new());
    let queue = OfflineQueue::new(persistence.clone(), backend.clone(), &AppConfig::default());

    queue
        .capture_attachment("tree-photo", vec![7, 7], "image/jpeg")
        .await
        .unwrap();
    let rejected = queue
        .enqueue(
            ActionType::DeleteRecord,
            ActionPayload::new(json!({"id": "tree-1"})).with_attachment("tree-photo"),
        )
        .await;
    assert!(rejected.is_err());

    let create = queue
        .enqueue(
            ActionType::CreateRecord,
            ActionPayload::new(json!({"name": "Tree-001"})).with_attachment("tree-photo"),
        )
        .await
        .unwrap();
    assert_eq!(report(queue.sync_now().await).succeeded, 1);

    let url = format!("mock://field-photos/{}/tree-photo", create.id);
    let calls = backend.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], BackendCall::Upload { bytes, .. } if *bytes == vec![7, 7]));
    assert!(matches!(
        &calls[1],
        BackendCall::Insert { table, row } if table == "trees" && row["photo_url"] == url.as_str()
    ));
}
