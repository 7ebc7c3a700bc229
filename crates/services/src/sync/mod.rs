mod backoff;
mod orchestrator;
mod queue;

// Public API of the sync subsystem.
pub use crate::error::SyncQueueError;
pub use orchestrator::{SyncDiagnostics, SyncOrchestrator};
pub use queue::{DEFAULT_QUEUE_CAPACITY, FlushReport, SyncQueueService};
