use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::model::ids::{CertificationId, ExamId, QuestionId};
use crate::model::exam::SessionKind;

//
// ─── ITEM IDENTITY ─────────────────────────────────────────────────────────────
//

/// Identifier for an outbound mutation.
///
/// Answers use a deterministic id derived from session and question, so
/// editing the same answer repeatedly collapses into one queued item.
/// Reviews and exam submissions are distinct events and get unique tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueItemId(String);

impl QueueItemId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic idempotency key for a per-question answer.
    #[must_use]
    pub fn for_answer(exam_id: ExamId, question_id: QuestionId) -> Self {
        Self(format!("answer:{exam_id}:{question_id}"))
    }

    /// Unique token for a full-exam submission.
    #[must_use]
    pub fn for_exam_submission(exam_id: ExamId) -> Self {
        Self(format!("exam:{exam_id}"))
    }

    /// Fresh unique token for items that are distinct events (reviews).
    #[must_use]
    pub fn unique(kind: QueueItemKind) -> Self {
        Self(format!("{}:{}", kind.as_str(), Uuid::new_v4()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//
// ─── KIND & STATUS ─────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueItemKind {
    Answer,
    Review,
    FullExam,
}

impl QueueItemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QueueItemKind::Answer => "answer",
            QueueItemKind::Review => "review",
            QueueItemKind::FullExam => "full_exam",
        }
    }
}

impl fmt::Display for QueueItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending items are retried; dead-letter items have exhausted their retry
/// budget and sit out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueItemStatus {
    Pending,
    DeadLetter,
}

impl QueueItemStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ─── QUEUE ITEM ────────────────────────────────────────────────────────────────
//

/// One durable outbound mutation awaiting sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
    pub id: QueueItemId,
    pub kind: QueueItemKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: QueueItemStatus,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    #[must_use]
    pub fn new(
        id: QueueItemId,
        kind: QueueItemKind,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            payload,
            created_at,
            retry_count: 0,
            status: QueueItemStatus::Pending,
            last_error: None,
            last_attempt_at: None,
        }
    }
}

//
// ─── PAYLOADS ──────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PayloadError {
    #[error("review quality {0} outside 0..=5")]
    InvalidQuality(u8),
}

/// A single answer given during a practice session.
///
/// Self-contained on purpose: flush can create the server session and post
/// this answer even after the local session state is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub exam_id: ExamId,
    pub certification_id: CertificationId,
    pub kind: SessionKindTag,
    pub question_count: u32,
    pub question_id: QuestionId,
    pub selected_answers: Vec<u32>,
    pub time_spent_seconds: u32,
}

/// A spaced-review quality rating for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub question_id: QuestionId,
    pub quality: u8,
}

impl ReviewPayload {
    /// # Errors
    ///
    /// Returns `PayloadError::InvalidQuality` if `quality` exceeds 5.
    pub fn new(question_id: QuestionId, quality: u8) -> Result<Self, PayloadError> {
        if quality > 5 {
            return Err(PayloadError::InvalidQuality(quality));
        }
        Ok(Self {
            question_id,
            quality,
        })
    }
}

/// One graded response inside a full-exam submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamResponse {
    pub question_id: QuestionId,
    pub selected_answers: Vec<u32>,
    pub correct: bool,
}

/// Everything the server needs to replay a completed offline exam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamSubmissionPayload {
    pub client_token: ExamId,
    pub certification_id: CertificationId,
    pub kind: SessionKindTag,
    pub responses: Vec<ExamResponse>,
    pub question_count: u32,
    pub correct_count: u32,
    pub total_time_seconds: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Serialized form of [`SessionKind`] inside JSON payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKindTag {
    Exam,
    Practice,
}

impl From<SessionKind> for SessionKindTag {
    fn from(kind: SessionKind) -> Self {
        match kind {
            SessionKind::Exam => SessionKindTag::Exam,
            SessionKind::Practice => SessionKindTag::Practice,
        }
    }
}

impl From<SessionKindTag> for SessionKind {
    fn from(tag: SessionKindTag) -> Self {
        match tag {
            SessionKindTag::Exam => SessionKind::Exam,
            SessionKindTag::Practice => SessionKind::Practice,
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    #[test]
    fn answer_ids_are_deterministic() {
        let exam = ExamId::generate();
        let a = QueueItemId::for_answer(exam, QuestionId::new(7));
        let b = QueueItemId::for_answer(exam, QuestionId::new(7));
        let c = QueueItemId::for_answer(exam, QuestionId::new(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn review_ids_are_unique() {
        assert_ne!(
            QueueItemId::unique(QueueItemKind::Review),
            QueueItemId::unique(QueueItemKind::Review)
        );
    }

    #[test]
    fn review_quality_is_bounded() {
        assert!(ReviewPayload::new(QuestionId::new(1), 5).is_ok());
        assert!(matches!(
            ReviewPayload::new(QuestionId::new(1), 6),
            Err(PayloadError::InvalidQuality(6))
        ));
    }

    #[test]
    fn submission_payload_roundtrips_through_json() {
        let payload = ExamSubmissionPayload {
            client_token: ExamId::generate(),
            certification_id: CertificationId::new(3),
            kind: SessionKindTag::Exam,
            responses: vec![ExamResponse {
                question_id: QuestionId::new(1),
                selected_answers: vec![0, 2],
                correct: true,
            }],
            question_count: 10,
            correct_count: 1,
            total_time_seconds: 600,
            started_at: fixed_now(),
            completed_at: fixed_now(),
        };

        let value = serde_json::to_value(&payload).unwrap();
        let back: ExamSubmissionPayload = serde_json::from_value(value).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn new_item_starts_pending_with_no_retries() {
        let item = SyncQueueItem::new(
            QueueItemId::unique(QueueItemKind::Review),
            QueueItemKind::Review,
            serde_json::json!({}),
            fixed_now(),
        );
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert!(item.last_error.is_none());
    }
}
