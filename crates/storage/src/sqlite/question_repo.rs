use std::collections::HashMap;

use exam_core::model::{
    CacheMetadata, CachedQuestion, CertificationId, QuestionFilter, QuestionId,
};
use sqlx::Row;

use super::{
    SqliteRepository,
    mapping::{self, id_to_i64, map_question_row, ser},
};
use crate::repository::{QuestionCacheRepository, StorageError};

const QUESTION_COLUMNS: &str = r"
    id, certification_id, domain_id, topic_id, difficulty,
    prompt, options, correct_answers, explanation, cached_at
";

/// Recompute every certification's metadata count from the surviving rows.
/// Runs inside the caller's transaction so the count invariant holds even
/// if the connection dies mid-eviction.
async fn recount_metadata(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
) -> Result<(), StorageError> {
    sqlx::query(
        r"
        UPDATE cache_metadata
        SET question_count = (
            SELECT COUNT(*) FROM cached_questions
            WHERE cached_questions.certification_id = cache_metadata.certification_id
        )
        ",
    )
    .execute(&mut **tx)
    .await
    .map_err(|e| StorageError::Connection(e.to_string()))?;
    Ok(())
}

#[async_trait::async_trait]
impl QuestionCacheRepository for SqliteRepository {
    async fn replace_certification(
        &self,
        certification_id: CertificationId,
        questions: &[CachedQuestion],
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let cert = id_to_i64("certification_id", certification_id.value())?;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query("DELETE FROM cached_questions WHERE certification_id = ?1")
            .bind(cert)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        for question in questions {
            sqlx::query(
                r"
                INSERT INTO cached_questions (
                    id, certification_id, domain_id, topic_id, difficulty,
                    prompt, options, correct_answers, explanation, cached_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(id) DO UPDATE SET
                    certification_id = excluded.certification_id,
                    domain_id = excluded.domain_id,
                    topic_id = excluded.topic_id,
                    difficulty = excluded.difficulty,
                    prompt = excluded.prompt,
                    options = excluded.options,
                    correct_answers = excluded.correct_answers,
                    explanation = excluded.explanation,
                    cached_at = excluded.cached_at
                ",
            )
            .bind(id_to_i64("question_id", question.id().value())?)
            .bind(cert)
            .bind(id_to_i64("domain_id", question.domain_id().value())?)
            .bind(id_to_i64("topic_id", question.topic_id().value())?)
            .bind(question.difficulty().as_str())
            .bind(question.prompt())
            .bind(mapping::to_json(&question.options())?)
            .bind(mapping::to_json(&question.correct_answers())?)
            .bind(question.explanation())
            .bind(question.cached_at())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        }

        sqlx::query(
            r"
            INSERT INTO cache_metadata (certification_id, question_count, cached_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(certification_id) DO UPDATE SET
                question_count = excluded.question_count,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at
            ",
        )
        .bind(cert)
        .bind(i64::from(metadata.question_count()))
        .bind(metadata.cached_at())
        .bind(metadata.expires_at())
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        // a question id stolen from another certification shifts its count
        recount_metadata(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn questions_for(
        &self,
        certification_id: CertificationId,
        filter: &QuestionFilter,
    ) -> Result<Vec<CachedQuestion>, StorageError> {
        let sql = format!(
            r"
            SELECT {QUESTION_COLUMNS}
            FROM cached_questions
            WHERE certification_id = ?1
              AND (?2 IS NULL OR domain_id = ?2)
              AND (?3 IS NULL OR topic_id = ?3)
              AND (?4 IS NULL OR difficulty = ?4)
            ORDER BY id ASC
            "
        );

        let domain = filter
            .domain_id
            .map(|d| id_to_i64("domain_id", d.value()))
            .transpose()?;
        let topic = filter
            .topic_id
            .map(|t| id_to_i64("topic_id", t.value()))
            .transpose()?;

        let rows = sqlx::query(&sql)
            .bind(id_to_i64("certification_id", certification_id.value())?)
            .bind(domain)
            .bind(topic)
            .bind(filter.difficulty.map(|d| d.as_str()))
            .fetch_all(self.pool())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut questions = Vec::with_capacity(rows.len());
        for row in rows {
            questions.push(map_question_row(&row)?);
        }
        Ok(questions)
    }

    async fn get_questions(
        &self,
        ids: &[QuestionId],
    ) -> Result<Vec<CachedQuestion>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            r"
            SELECT {QUESTION_COLUMNS}
            FROM cached_questions
            WHERE id IN (
            "
        );
        for i in 0..ids.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            sql.push_str(&(i + 1).to_string());
        }
        sql.push_str(")\n");

        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id_to_i64("question_id", id.value())?);
        }

        let rows = q
            .fetch_all(self.pool())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut by_id: HashMap<QuestionId, CachedQuestion> = HashMap::with_capacity(rows.len());
        for row in rows {
            let question = map_question_row(&row)?;
            by_id.insert(question.id(), question);
        }

        // input order, missing ids skipped
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn get_metadata(
        &self,
        certification_id: CertificationId,
    ) -> Result<Option<CacheMetadata>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT certification_id, question_count, cached_at, expires_at
            FROM cache_metadata
            WHERE certification_id = ?1
            ",
        )
        .bind(id_to_i64("certification_id", certification_id.value())?)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let count_i64: i64 = row.try_get("question_count").map_err(ser)?;
        let question_count = u32::try_from(count_i64)
            .map_err(|_| StorageError::Serialization(format!("invalid count: {count_i64}")))?;

        let metadata = CacheMetadata::from_persisted(
            certification_id,
            question_count,
            row.try_get("cached_at").map_err(ser)?,
            row.try_get("expires_at").map_err(ser)?,
        )
        .map_err(ser)?;
        Ok(Some(metadata))
    }

    async fn total_cached(&self) -> Result<u32, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM cached_questions")
            .fetch_one(self.pool())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let total: i64 = row.try_get("total").map_err(ser)?;
        u32::try_from(total)
            .map_err(|_| StorageError::Serialization(format!("invalid total: {total}")))
    }

    async fn prune_lru(&self, max_total: u32) -> Result<u32, StorageError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let row = sqlx::query("SELECT COUNT(*) AS total FROM cached_questions")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let total: i64 = row.try_get("total").map_err(ser)?;
        let excess = total - i64::from(max_total);
        if excess <= 0 {
            return Ok(0);
        }

        sqlx::query(
            r"
            DELETE FROM cached_questions
            WHERE id IN (
                SELECT id FROM cached_questions
                ORDER BY cached_at ASC, id ASC
                LIMIT ?1
            )
            ",
        )
        .bind(excess)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        recount_metadata(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        u32::try_from(excess)
            .map_err(|_| StorageError::Serialization(format!("invalid excess: {excess}")))
    }

    async fn delete_questions(&self, ids: &[QuestionId]) -> Result<(), StorageError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut sql = String::from("DELETE FROM cached_questions WHERE id IN (");
        for i in 0..ids.len() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            sql.push_str(&(i + 1).to_string());
        }
        sql.push(')');

        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id_to_i64("question_id", id.value())?);
        }
        q.execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        recount_metadata(&mut tx).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn clear_certification(
        &self,
        certification_id: CertificationId,
    ) -> Result<(), StorageError> {
        let cert = id_to_i64("certification_id", certification_id.value())?;
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query("DELETE FROM cached_questions WHERE certification_id = ?1")
            .bind(cert)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        sqlx::query("DELETE FROM cache_metadata WHERE certification_id = ?1")
            .bind(cert)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query("DELETE FROM cached_questions")
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        sqlx::query("DELETE FROM cache_metadata")
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}
