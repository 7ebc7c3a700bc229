use std::sync::Arc;

use exam_core::Clock;
use storage::repository::Storage;

use crate::api::ExamApi;
use crate::cache_service::CacheService;
use crate::error::AppServicesError;
use crate::exams::ExamFlowService;
use crate::host::HostPlatform;
use crate::sync::{SyncOrchestrator, SyncQueueService};

/// Assembles the offline engine's services over one storage backend.
#[derive(Clone)]
pub struct AppServices {
    cache: Arc<CacheService>,
    exam_flow: Arc<ExamFlowService>,
    sync_queue: Arc<SyncQueueService>,
    orchestrator: Arc<SyncOrchestrator>,
}

impl AppServices {
    /// Build services backed by `SQLite`.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if the store cannot be opened or migrated.
    /// Store-open failure is fatal; there is no silent fallback.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        api: Arc<dyn ExamApi>,
        host: Arc<dyn HostPlatform>,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::with_storage(storage, clock, api, host))
    }

    /// Build services over an already-open storage backend.
    #[must_use]
    pub fn with_storage(
        storage: Storage,
        clock: Clock,
        api: Arc<dyn ExamApi>,
        host: Arc<dyn HostPlatform>,
    ) -> Self {
        let cache = Arc::new(CacheService::new(
            clock,
            Arc::clone(&api),
            Arc::clone(&storage.questions),
        ));
        let sync_queue = Arc::new(SyncQueueService::new(
            clock,
            Arc::clone(&storage.queue),
            Arc::clone(&storage.exams),
            api,
            Arc::clone(&host),
        ));
        let exam_flow = Arc::new(ExamFlowService::new(
            clock,
            Arc::clone(&cache),
            Arc::clone(&storage.exams),
            Arc::clone(&sync_queue),
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(Arc::clone(&sync_queue), host));

        Self {
            cache,
            exam_flow,
            sync_queue,
            orchestrator,
        }
    }

    #[must_use]
    pub fn cache(&self) -> Arc<CacheService> {
        Arc::clone(&self.cache)
    }

    #[must_use]
    pub fn exam_flow(&self) -> Arc<ExamFlowService> {
        Arc::clone(&self.exam_flow)
    }

    #[must_use]
    pub fn sync_queue(&self) -> Arc<SyncQueueService> {
        Arc::clone(&self.sync_queue)
    }

    #[must_use]
    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        Arc::clone(&self.orchestrator)
    }
}
