use chrono::{DateTime, Utc};
use exam_core::model::{QueueItemId, QueueItemStatus, SyncQueueItem};
use sqlx::Row;

use super::{
    SqliteRepository,
    mapping::{self, map_queue_item_row, ser},
};
use crate::repository::{StorageError, SyncQueueRepository};

const ITEM_COLUMNS: &str = r"
    id, kind, payload, created_at, retry_count, status, last_error, last_attempt_at
";

async fn count_by_status(
    repo: &SqliteRepository,
    status: QueueItemStatus,
) -> Result<u32, StorageError> {
    let row = sqlx::query("SELECT COUNT(*) AS total FROM sync_queue WHERE status = ?1")
        .bind(status.as_str())
        .fetch_one(repo.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;
    let total: i64 = row.try_get("total").map_err(ser)?;
    u32::try_from(total).map_err(|_| StorageError::Serialization(format!("invalid total: {total}")))
}

#[async_trait::async_trait]
impl SyncQueueRepository for SqliteRepository {
    async fn upsert_item(&self, item: &SyncQueueItem) -> Result<(), StorageError> {
        // UPDATE first so a replaced item keeps its queue position (seq).
        let updated = sqlx::query(
            r"
            UPDATE sync_queue
            SET kind = ?2, payload = ?3, created_at = ?4, retry_count = ?5,
                status = ?6, last_error = ?7, last_attempt_at = ?8
            WHERE id = ?1
            ",
        )
        .bind(item.id.as_str())
        .bind(item.kind.as_str())
        .bind(mapping::to_json(&item.payload)?)
        .bind(item.created_at)
        .bind(i64::from(item.retry_count))
        .bind(item.status.as_str())
        .bind(item.last_error.as_deref())
        .bind(item.last_attempt_at)
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        sqlx::query(
            r"
            INSERT INTO sync_queue (
                id, kind, payload, created_at, retry_count, status, last_error, last_attempt_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
        )
        .bind(item.id.as_str())
        .bind(item.kind.as_str())
        .bind(mapping::to_json(&item.payload)?)
        .bind(item.created_at)
        .bind(i64::from(item.retry_count))
        .bind(item.status.as_str())
        .bind(item.last_error.as_deref())
        .bind(item.last_attempt_at)
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn get_item(&self, id: &QueueItemId) -> Result<Option<SyncQueueItem>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM sync_queue WHERE id = ?1"
        ))
        .bind(id.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        row.map(|r| map_queue_item_row(&r)).transpose()
    }

    async fn pending_in_order(&self, limit: u32) -> Result<Vec<SyncQueueItem>, StorageError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ITEM_COLUMNS}
            FROM sync_queue
            WHERE status = 'pending'
            ORDER BY created_at ASC, seq ASC
            LIMIT ?1
            "
        ))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(map_queue_item_row(&row)?);
        }
        Ok(items)
    }

    async fn delete_item(&self, id: &QueueItemId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
            .bind(id.as_str())
            .execute(self.pool())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn count_pending(&self) -> Result<u32, StorageError> {
        count_by_status(self, QueueItemStatus::Pending).await
    }

    async fn count_dead_letter(&self) -> Result<u32, StorageError> {
        count_by_status(self, QueueItemStatus::DeadLetter).await
    }

    async fn evict_oldest_pending(&self, count: u32) -> Result<u32, StorageError> {
        let result = sqlx::query(
            r"
            DELETE FROM sync_queue
            WHERE id IN (
                SELECT id FROM sync_queue
                WHERE status = 'pending'
                ORDER BY created_at ASC, seq ASC
                LIMIT ?1
            )
            ",
        )
        .bind(i64::from(count))
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        u32::try_from(result.rows_affected())
            .map_err(|_| StorageError::Serialization("evicted count overflow".into()))
    }

    async fn record_failure(
        &self,
        id: &QueueItemId,
        retry_count: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE sync_queue
            SET retry_count = ?2, last_error = ?3, last_attempt_at = ?4
            WHERE id = ?1
            ",
        )
        .bind(id.as_str())
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(at)
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        id: &QueueItemId,
        retry_count: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r"
            UPDATE sync_queue
            SET status = 'dead_letter', retry_count = ?2, last_error = ?3, last_attempt_at = ?4
            WHERE id = ?1
            ",
        )
        .bind(id.as_str())
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(at)
        .execute(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn dead_letter_items(&self, limit: u32) -> Result<Vec<SyncQueueItem>, StorageError> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {ITEM_COLUMNS}
            FROM sync_queue
            WHERE status = 'dead_letter'
            ORDER BY created_at ASC, seq ASC
            LIMIT ?1
            "
        ))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(map_queue_item_row(&row)?);
        }
        Ok(items)
    }
}
