mod cache_meta;
mod exam;
mod ids;
mod question;
mod queue;

pub use ids::{CertificationId, DomainId, ExamId, ParseIdError, QuestionId, TopicId};

pub use cache_meta::{CACHE_TTL_DAYS, CacheMetadata, CacheMetadataError};
pub use exam::{
    DEFAULT_EXAM_DURATION_SECS, ExamError, ExamScore, ExamStatus, OfflineExam, SessionKind,
};
pub use question::{CachedQuestion, Difficulty, QuestionError, QuestionFilter};
pub use queue::{
    AnswerPayload, ExamResponse, ExamSubmissionPayload, PayloadError, QueueItemId, QueueItemKind,
    QueueItemStatus, ReviewPayload, SessionKindTag, SyncQueueItem,
};
