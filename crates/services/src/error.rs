//! Shared error types for the services crate.

use thiserror::Error;

use exam_core::model::{
    CertificationId, ExamError, ExamId, ExamStatus, PayloadError, QuestionError,
};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

use crate::api::ApiError;

/// Errors emitted by `CacheService`.
///
/// A fetch failure never destroys an existing valid cache: the prior rows
/// stay in place and the caller reports the cache as stale.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("question download failed: {0}")]
    Fetch(#[source] ApiError),
    #[error("remote returned no questions for certification {0}")]
    EmptyDownload(CertificationId),
    #[error(transparent)]
    Question(#[from] QuestionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `SyncQueueService`.
///
/// Individual item failures during a flush are aggregated into counts, not
/// surfaced here; only storage faults and encoding bugs propagate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncQueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Review(#[from] PayloadError),
}

/// Errors emitted by `ExamFlowService`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExamFlowError {
    #[error("exam {0} not found")]
    NotFound(ExamId),
    #[error("certification {0} has no usable offline cache")]
    NoUsableCache(CertificationId),
    #[error("exam {0} cannot resume: all of its cached questions are gone")]
    QuestionsUnavailable(ExamId),
    #[error("exam is not resumable (status: {0})")]
    NotResumable(ExamStatus),
    #[error("a submission is already running for exam {0}")]
    SubmissionInProgress(ExamId),
    #[error(transparent)]
    Exam(#[from] ExamError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Queue(#[from] SyncQueueError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
