//! Queue drain.
//!
//! A drain pass walks a snapshot of the action store oldest-first and
//! dispatches each action exactly once. Failures are recorded on the action
//! and the pass moves on. Only one pass runs at a time; a trigger that
//! arrives while a pass is running is a no-op.

use chrono::Utc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::dispatch::{DispatchTable, ResolvedAction};
use crate::sync::retry::{RetryDecision, RetryPolicy};
use crate::sync::store::{ActionStore, AttachmentCache};
use crate::types::{FailureKind, PendingAction};

const IDLE: u8 = 0;
const DRAINING: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Draining,
}

/// Counts for one completed drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub missing_attachments: usize,
    /// Not yet due under the retry policy.
    pub deferred: usize,
    /// Over the attempt cap; left queued but not dispatched.
    pub parked: usize,
    pub persistence_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    AlreadyDraining,
    /// Manual trigger while offline; the store was not touched.
    Offline,
}

/// Returns the orchestrator to `Idle` on every exit path, including unwinding.
struct DrainGuard<'a> {
    state: &'a AtomicU8,
}

impl<'a> DrainGuard<'a> {
    fn acquire(state: &'a AtomicU8) -> Option<Self> {
        state
            .compare_exchange(IDLE, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { state })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    actions: Arc<dyn ActionStore>,
    attachments: Arc<dyn AttachmentCache>,
    dispatch: DispatchTable,
    retry: RetryPolicy,
    connectivity: Arc<ConnectivityMonitor>,
    state: AtomicU8,
}

impl SyncOrchestrator {
    pub fn new(
        actions: Arc<dyn ActionStore>,
        attachments: Arc<dyn AttachmentCache>,
        dispatch: DispatchTable,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            actions,
            attachments,
            dispatch,
            retry: RetryPolicy::default(),
            connectivity,
            state: AtomicU8::new(IDLE),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        match self.state.load(Ordering::Acquire) {
            DRAINING => OrchestratorState::Draining,
            _ => OrchestratorState::Idle,
        }
    }

    pub fn is_draining(&self) -> bool {
        self.state() == OrchestratorState::Draining
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.dispatch
    }

    /// Manual trigger: drain if online, otherwise report `Offline`.
    pub async fn sync_now(&self) -> DrainOutcome {
        if !self.connectivity.is_online() {
            debug!("Manual sync requested while offline");
            return DrainOutcome::Offline;
        }
        self.drain().await
    }

    /// Run one drain pass over the actions queued right now.
    ///
    /// Actions enqueued while the pass runs wait for the next pass.
    pub async fn drain(&self) -> DrainOutcome {
        let Some(_guard) = DrainGuard::acquire(&self.state) else {
            debug!("Drain already in progress, ignoring trigger");
            return DrainOutcome::AlreadyDraining;
        };

        let mut report = DrainReport::default();
        let snapshot = match self.actions.list_ordered().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Failed to read action queue: {}", e);
                report.persistence_errors += 1;
                return DrainOutcome::Completed(report);
            }
        };

        if snapshot.is_empty() {
            debug!("Action queue is empty");
            return DrainOutcome::Completed(report);
        }
        info!("Draining {} queued actions", snapshot.len());

        let now = Utc::now();
        for action in &snapshot {
            match self.retry.decide(action, now) {
                RetryDecision::Due => {}
                RetryDecision::Wait(remaining) => {
                    debug!(
                        "Deferring action {} for another {:?}",
                        action.id, remaining
                    );
                    report.deferred += 1;
                    continue;
                }
                RetryDecision::Parked => {
                    report.parked += 1;
                    continue;
                }
            }
            self.process(action, &mut report).await;
        }

        info!(
            "Drain finished: {} attempted, {} succeeded, {} failed, {} missing attachments",
            report.attempted, report.succeeded, report.failed, report.missing_attachments
        );
        DrainOutcome::Completed(report)
    }

    async fn process(&self, action: &PendingAction, report: &mut DrainReport) {
        report.attempted += 1;

        if let Err(e) = self.actions.mark_syncing(&action.id).await {
            error!("Failed to mark action {} as syncing: {}", action.id, e);
            report.persistence_errors += 1;
            return;
        }

        match self.dispatch_one(action).await {
            Ok(()) => {
                report.succeeded += 1;
                if let Err(e) = self.actions.remove(&action.id).await {
                    error!(
                        "Action {} was applied remotely but could not be removed: {}",
                        action.id, e
                    );
                    report.persistence_errors += 1;
                }
            }
            Err(err) => {
                let kind = if err.is_retryable() {
                    report.failed += 1;
                    warn!(
                        "Action {} ({}) failed: {}",
                        action.id, action.action_type, err
                    );
                    FailureKind::Dispatch
                } else {
                    report.missing_attachments += 1;
                    warn!("Action {} needs its attachment recaptured: {}", action.id, err);
                    FailureKind::MissingAttachment
                };
                if let Err(e) = self
                    .actions
                    .mark_failed(&action.id, kind, &err.detail())
                    .await
                {
                    error!("Failed to record failure of action {}: {}", action.id, e);
                    report.persistence_errors += 1;
                }
            }
        }
    }

    async fn dispatch_one(&self, action: &PendingAction) -> Result<()> {
        let attachment = match &action.payload.attachment {
            Some(key) => Some(self.attachments.get(key).await?.ok_or_else(|| {
                SyncError::MissingAttachment {
                    action_id: action.id.clone(),
                    key: key.clone(),
                }
            })?),
            None => None,
        };

        let resolved = ResolvedAction {
            id: action.id.clone(),
            action_type: action.action_type.clone(),
            data: action.payload.data.clone(),
            created_at: action.created_at,
            attachment,
        };
        self.dispatch.dispatch(&resolved).await
    }
}
