use std::sync::Arc;

use crate::error::Result;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::store::ActionStore;
use crate::types::{PendingAction, SyncStatus};

/// Read-only view of the queue for the UI.
#[derive(Clone)]
pub struct StatusReporter {
    actions: Arc<dyn ActionStore>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl StatusReporter {
    pub fn new(actions: Arc<dyn ActionStore>, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            actions,
            orchestrator,
        }
    }

    pub async fn snapshot(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            pending_count: self.actions.count().await?,
            is_syncing: self.orchestrator.is_draining(),
            is_online: self.orchestrator.connectivity().is_online(),
        })
    }

    /// The oldest action whose last attempt failed, for surfacing to the user.
    pub async fn oldest_failure(&self) -> Result<Option<PendingAction>> {
        self.actions.oldest_failure().await
    }
}
