use std::str::FromStr;

use exam_core::model::{
    CachedQuestion, CertificationId, Difficulty, DomainId, ExamId, ExamStatus, QuestionId,
    QueueItemId, QueueItemKind, QueueItemStatus, SessionKind, SyncQueueItem, TopicId,
};
use sqlx::Row;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(crate) fn id_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

pub(crate) fn certification_id_from_i64(v: i64) -> Result<CertificationId, StorageError> {
    Ok(CertificationId::new(i64_to_u64("certification_id", v)?))
}

pub(crate) fn question_id_from_i64(v: i64) -> Result<QuestionId, StorageError> {
    Ok(QuestionId::new(i64_to_u64("question_id", v)?))
}

pub(crate) fn exam_id_from_str(s: &str) -> Result<ExamId, StorageError> {
    ExamId::from_str(s).map_err(ser)
}

pub(crate) fn parse_exam_status(s: &str) -> Result<ExamStatus, StorageError> {
    match s {
        "in_progress" => Ok(ExamStatus::InProgress),
        "completed" => Ok(ExamStatus::Completed),
        "abandoned" => Ok(ExamStatus::Abandoned),
        _ => Err(StorageError::Serialization(format!("invalid status: {s}"))),
    }
}

pub(crate) fn parse_session_kind(s: &str) -> Result<SessionKind, StorageError> {
    match s {
        "exam" => Ok(SessionKind::Exam),
        "practice" => Ok(SessionKind::Practice),
        _ => Err(StorageError::Serialization(format!("invalid kind: {s}"))),
    }
}

pub(crate) fn parse_queue_kind(s: &str) -> Result<QueueItemKind, StorageError> {
    match s {
        "answer" => Ok(QueueItemKind::Answer),
        "review" => Ok(QueueItemKind::Review),
        "full_exam" => Ok(QueueItemKind::FullExam),
        _ => Err(StorageError::Serialization(format!("invalid kind: {s}"))),
    }
}

pub(crate) fn parse_queue_status(s: &str) -> Result<QueueItemStatus, StorageError> {
    match s {
        "pending" => Ok(QueueItemStatus::Pending),
        "dead_letter" => Ok(QueueItemStatus::DeadLetter),
        _ => Err(StorageError::Serialization(format!("invalid status: {s}"))),
    }
}

/// Encode a JSON column (options, correct answers, selections).
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(ser)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_str(raw).map_err(ser)
}

pub(crate) fn map_question_row(row: &sqlx::sqlite::SqliteRow) -> Result<CachedQuestion, StorageError> {
    let difficulty_raw: String = row.try_get("difficulty").map_err(ser)?;
    let difficulty = Difficulty::from_str(&difficulty_raw).map_err(ser)?;

    let options: Vec<String> = from_json(row.try_get::<&str, _>("options").map_err(ser)?)?;
    let correct_answers: Vec<u32> =
        from_json(row.try_get::<&str, _>("correct_answers").map_err(ser)?)?;

    CachedQuestion::from_persisted(
        question_id_from_i64(row.try_get::<i64, _>("id").map_err(ser)?)?,
        certification_id_from_i64(row.try_get::<i64, _>("certification_id").map_err(ser)?)?,
        DomainId::new(i64_to_u64(
            "domain_id",
            row.try_get::<i64, _>("domain_id").map_err(ser)?,
        )?),
        TopicId::new(i64_to_u64(
            "topic_id",
            row.try_get::<i64, _>("topic_id").map_err(ser)?,
        )?),
        difficulty,
        row.try_get::<String, _>("prompt").map_err(ser)?,
        options,
        correct_answers,
        row.try_get::<Option<String>, _>("explanation").map_err(ser)?,
        row.try_get("cached_at").map_err(ser)?,
    )
    .map_err(ser)
}

pub(crate) fn map_queue_item_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<SyncQueueItem, StorageError> {
    let kind_raw: String = row.try_get("kind").map_err(ser)?;
    let status_raw: String = row.try_get("status").map_err(ser)?;
    let payload: serde_json::Value = from_json(row.try_get::<&str, _>("payload").map_err(ser)?)?;

    let retry_count_i64: i64 = row.try_get("retry_count").map_err(ser)?;
    let retry_count = u32::try_from(retry_count_i64).map_err(|_| {
        StorageError::Serialization(format!("invalid retry_count: {retry_count_i64}"))
    })?;

    Ok(SyncQueueItem {
        id: QueueItemId::new(row.try_get::<String, _>("id").map_err(ser)?),
        kind: parse_queue_kind(&kind_raw)?,
        payload,
        created_at: row.try_get("created_at").map_err(ser)?,
        retry_count,
        status: parse_queue_status(&status_raw)?,
        last_error: row.try_get("last_error").map_err(ser)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(ser)?,
    })
}
