pub mod connectivity;
pub mod coordinator;
pub mod dispatch;
pub mod orchestrator;
pub mod retry;
pub mod status;
pub mod store;

pub use connectivity::{Connectivity, ConnectivityChange, ConnectivityMonitor};
pub use coordinator::{
    start_sync_coordinator, CoordinatorHandle, SyncCoordinator, SyncCoordinatorConfig,
};
pub use dispatch::{
    ActionHandler, BackendMapping, DispatchTable, FunctionHandler, ResolvedAction, StandardHandler,
};
pub use orchestrator::{DrainOutcome, DrainReport, OrchestratorState, SyncOrchestrator};
pub use retry::{RetryDecision, RetryPolicy};
pub use status::StatusReporter;
pub use store::{ActionStore, AttachmentCache};
