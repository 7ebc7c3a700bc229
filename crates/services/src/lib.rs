#![forbid(unsafe_code)]

pub mod api;
pub mod app_services;
pub mod cache_service;
pub mod error;
pub mod exams;
pub mod host;
pub mod sync;

pub use exam_core::Clock;

pub use api::{ApiConfig, ApiError, ExamApi, HttpExamApi};
pub use app_services::AppServices;
pub use cache_service::{CacheService, CacheStatus, DEFAULT_CACHE_CAPACITY};
pub use error::{AppServicesError, CacheError, ExamFlowError, SyncQueueError};
pub use exams::{ExamFlowService, ResumedExam, StartedExam, SubmittedExam};
pub use host::{HostPlatform, ManualHost, StorageQuota};
pub use sync::{
    DEFAULT_QUEUE_CAPACITY, FlushReport, SyncDiagnostics, SyncOrchestrator, SyncQueueService,
};
