/// Background sync coordinator: decides when the queue is drained
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::sync::orchestrator::{DrainOutcome, SyncOrchestrator};
use crate::sync::store::ActionStore;

/// Configuration for the sync coordinator
#[derive(Debug, Clone)]
pub struct SyncCoordinatorConfig {
    /// How often to drain a non-empty queue while online (in seconds)
    pub sync_interval_secs: u64,
    /// How often to probe the backend; 0 disables the heartbeat
    pub heartbeat_interval_secs: u64,
    /// How long a probe may take before the backend counts as unreachable
    pub heartbeat_timeout_secs: u64,
}

impl Default for SyncCoordinatorConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 30,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 5,
        }
    }
}

impl From<&SyncConfig> for SyncCoordinatorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            sync_interval_secs: config.interval_secs,
            heartbeat_interval_secs: config.heartbeat_secs,
            heartbeat_timeout_secs: config.heartbeat_timeout_secs,
        }
    }
}

/// Drains the queue on reconnect, on a timer, and on manual request.
pub struct SyncCoordinator {
    orchestrator: Arc<SyncOrchestrator>,
    actions: Arc<dyn ActionStore>,
    config: SyncCoordinatorConfig,
    manual: Notify,
}

impl SyncCoordinator {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        actions: Arc<dyn ActionStore>,
        config: SyncCoordinatorConfig,
    ) -> Self {
        Self {
            orchestrator,
            actions,
            config,
            manual: Notify::new(),
        }
    }

    /// Request a drain from outside the loop.
    pub fn trigger(&self) {
        self.manual.notify_one();
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting sync coordinator with interval {} seconds",
            self.config.sync_interval_secs
        );

        let mut interval = time::interval(Duration::from_secs(self.config.sync_interval_secs.max(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        let heartbeat_enabled = self.config.heartbeat_interval_secs > 0;
        let mut heartbeat =
            time::interval(Duration::from_secs(self.config.heartbeat_interval_secs.max(1)));
        heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        let mut changes = self.orchestrator.connectivity().subscribe();
        let mut drains = JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain_if_needed(&mut drains, "interval").await;
                }
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    self.probe().await;
                }
                change = changes.recv() => match change {
                    Ok(change) if change.online => {
                        self.drain_if_needed(&mut drains, "reconnect").await;
                    }
                    Ok(_) => debug!("Went offline, pausing sync"),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} connectivity events", skipped);
                        self.drain_if_needed(&mut drains, "reconnect").await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = self.manual.notified() => {
                    let orchestrator = self.orchestrator.clone();
                    drains.spawn(async move { orchestrator.sync_now().await });
                }
                Some(joined) = drains.join_next(), if !drains.is_empty() => {
                    log_drain(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown(drains).await;
    }

    async fn drain_if_needed(&self, drains: &mut JoinSet<DrainOutcome>, reason: &str) {
        if !self.orchestrator.connectivity().is_online() {
            debug!("Offline, skipping {} drain", reason);
            return;
        }
        match self.actions.count().await {
            Ok(0) => debug!("Queue empty, skipping {} drain", reason),
            Ok(pending) => {
                debug!("Starting {} drain with {} queued actions", reason, pending);
                let orchestrator = self.orchestrator.clone();
                drains.spawn(async move { orchestrator.drain().await });
            }
            Err(e) => error!("Failed to count queued actions: {}", e),
        }
    }

    async fn probe(&self) {
        let backend = self.orchestrator.dispatch_table().backend();
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        let reachable = match time::timeout(timeout, backend.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("Heartbeat failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Heartbeat timed out after {:?}", timeout);
                false
            }
        };
        self.orchestrator.connectivity().observe(reachable);
    }

    /// Wait for in-flight drains so no action is left `syncing`.
    async fn shutdown(&self, mut drains: JoinSet<DrainOutcome>) {
        info!("Shutting down sync coordinator");
        while let Some(joined) = drains.join_next().await {
            log_drain(joined);
        }
    }
}

fn log_drain(joined: Result<DrainOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(DrainOutcome::Completed(report)) => debug!("Drain completed: {:?}", report),
        Ok(outcome) => debug!("Drain skipped: {:?}", outcome),
        Err(e) => error!("Drain task failed: {}", e),
    }
}

/// Handle to a running coordinator task.
pub struct CoordinatorHandle {
    coordinator: Arc<SyncCoordinator>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn trigger(&self) {
        self.coordinator.trigger();
    }

    /// Stop the loop and wait for any running drain to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!("Sync coordinator task failed: {}", e);
        }
    }
}

/// Start the sync coordinator as a background task
pub fn start_sync_coordinator(
    orchestrator: Arc<SyncOrchestrator>,
    actions: Arc<dyn ActionStore>,
    config: SyncCoordinatorConfig,
) -> CoordinatorHandle {
    let coordinator = Arc::new(SyncCoordinator::new(orchestrator, actions, config));
    let (shutdown, rx) = watch::channel(false);

    let join = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator.start(rx).await;
        }
    });

    CoordinatorHandle {
        coordinator,
        shutdown,
        join,
    }
}
