use exam_core::model::{ExamId, ExamStatus, OfflineExam, QuestionId};
use sqlx::Row;

use super::{
    SqliteRepository,
    mapping::{
        self, certification_id_from_i64, exam_id_from_str, id_to_i64, parse_exam_status,
        parse_session_kind, question_id_from_i64, ser,
    },
};
use crate::repository::{ExamStateRepository, StorageError};

impl SqliteRepository {
    async fn load_exam_rows(&self, exam_id: &str) -> Result<Option<OfflineExam>, StorageError> {
        let header = sqlx::query(
            r"
            SELECT id, certification_id, kind, current_index, time_spent_seconds,
                   started_at, last_updated_at, status
            FROM offline_exams
            WHERE id = ?1
            ",
        )
        .bind(exam_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let Some(header) = header else {
            return Ok(None);
        };

        let question_rows = sqlx::query(
            r"
            SELECT question_id
            FROM offline_exam_questions
            WHERE exam_id = ?1
            ORDER BY position ASC
            ",
        )
        .bind(exam_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut question_ids = Vec::with_capacity(question_rows.len());
        for row in question_rows {
            question_ids.push(question_id_from_i64(
                row.try_get::<i64, _>("question_id").map_err(ser)?,
            )?);
        }

        let response_rows = sqlx::query(
            r"
            SELECT question_id, selected_answers
            FROM offline_exam_responses
            WHERE exam_id = ?1
            ",
        )
        .bind(exam_id)
        .fetch_all(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut responses: Vec<(QuestionId, Vec<u32>)> =
            Vec::with_capacity(response_rows.len());
        for row in response_rows {
            let question_id =
                question_id_from_i64(row.try_get::<i64, _>("question_id").map_err(ser)?)?;
            let selected: Vec<u32> =
                mapping::from_json(row.try_get::<&str, _>("selected_answers").map_err(ser)?)?;
            responses.push((question_id, selected));
        }

        let kind_raw: String = header.try_get("kind").map_err(ser)?;
        let status_raw: String = header.try_get("status").map_err(ser)?;

        let current_index_i64: i64 = header.try_get("current_index").map_err(ser)?;
        let current_index = u32::try_from(current_index_i64).map_err(|_| {
            StorageError::Serialization(format!("invalid current_index: {current_index_i64}"))
        })?;
        let time_spent_i64: i64 = header.try_get("time_spent_seconds").map_err(ser)?;
        let time_spent_seconds = u32::try_from(time_spent_i64).map_err(|_| {
            StorageError::Serialization(format!("invalid time_spent: {time_spent_i64}"))
        })?;

        let exam = OfflineExam::from_persisted(
            exam_id_from_str(header.try_get::<&str, _>("id").map_err(ser)?)?,
            certification_id_from_i64(
                header.try_get::<i64, _>("certification_id").map_err(ser)?,
            )?,
            parse_session_kind(&kind_raw)?,
            question_ids,
            current_index,
            responses,
            time_spent_seconds,
            header.try_get("started_at").map_err(ser)?,
            header.try_get("last_updated_at").map_err(ser)?,
            parse_exam_status(&status_raw)?,
        )
        .map_err(ser)?;
        Ok(Some(exam))
    }
}

#[async_trait::async_trait]
impl ExamStateRepository for SqliteRepository {
    async fn upsert_exam(&self, exam: &OfflineExam) -> Result<(), StorageError> {
        let exam_id = exam.id().to_string();
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query(
            r"
            INSERT INTO offline_exams (
                id, certification_id, kind, current_index, time_spent_seconds,
                started_at, last_updated_at, status
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                -- identity fields never change after creation
                current_index = excluded.current_index,
                time_spent_seconds = excluded.time_spent_seconds,
                last_updated_at = excluded.last_updated_at,
                status = excluded.status
            ",
        )
        .bind(&exam_id)
        .bind(id_to_i64("certification_id", exam.certification_id().value())?)
        .bind(exam.kind().as_str())
        .bind(i64::from(exam.current_index()))
        .bind(i64::from(exam.time_spent_seconds()))
        .bind(exam.started_at())
        .bind(exam.last_updated_at())
        .bind(exam.status().as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query("DELETE FROM offline_exam_questions WHERE exam_id = ?1")
            .bind(&exam_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        sqlx::query("DELETE FROM offline_exam_responses WHERE exam_id = ?1")
            .bind(&exam_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        for (position, question_id) in exam.question_ids().iter().enumerate() {
            sqlx::query(
                r"
                INSERT INTO offline_exam_questions (exam_id, position, question_id)
                VALUES (?1, ?2, ?3)
                ",
            )
            .bind(&exam_id)
            .bind(i64::try_from(position).map_err(ser)?)
            .bind(id_to_i64("question_id", question_id.value())?)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        }

        for (question_id, selected) in exam.responses() {
            sqlx::query(
                r"
                INSERT INTO offline_exam_responses (exam_id, question_id, selected_answers)
                VALUES (?1, ?2, ?3)
                ",
            )
            .bind(&exam_id)
            .bind(id_to_i64("question_id", question_id.value())?)
            .bind(mapping::to_json(&selected)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn get_exam(&self, id: ExamId) -> Result<Option<OfflineExam>, StorageError> {
        self.load_exam_rows(&id.to_string()).await
    }

    async fn delete_exam(&self, id: ExamId) -> Result<(), StorageError> {
        // child rows cascade
        sqlx::query("DELETE FROM offline_exams WHERE id = ?1")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: ExamStatus,
        limit: u32,
    ) -> Result<Vec<OfflineExam>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id
            FROM offline_exams
            WHERE status = ?1
            ORDER BY last_updated_at DESC
            LIMIT ?2
            ",
        )
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut exams = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(ser)?;
            if let Some(exam) = self.load_exam_rows(&id).await? {
                exams.push(exam);
            }
        }
        Ok(exams)
    }
}
