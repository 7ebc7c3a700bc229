use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use exam_core::model::{
    CacheMetadata, CachedQuestion, CertificationId, ExamId, ExamStatus, OfflineExam,
    QuestionFilter, QuestionId, QueueItemId, QueueItemStatus, SyncQueueItem,
};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── REPOSITORY CONTRACTS ──────────────────────────────────────────────────────
//

/// Persistence contract for the bounded question cache.
///
/// Multi-row mutations (replace, prune, clear) must be atomic: partial
/// failure leaves the prior consistent state, and the metadata question
/// count always equals the cached row count for that certification.
#[async_trait]
pub trait QuestionCacheRepository: Send + Sync {
    /// Replaces a certification's cached questions and metadata in one
    /// transaction. The old rows survive any failure.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot commit.
    async fn replace_certification(
        &self,
        certification_id: CertificationId,
        questions: &[CachedQuestion],
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError>;

    /// Cached questions for a certification, narrowed by the filter.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn questions_for(
        &self,
        certification_id: CertificationId,
        filter: &QuestionFilter,
    ) -> Result<Vec<CachedQuestion>, StorageError>;

    /// Fetches questions by id, in the order given. Missing ids are simply
    /// absent from the result; resume paths tolerate evicted rows.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn get_questions(
        &self,
        ids: &[QuestionId],
    ) -> Result<Vec<CachedQuestion>, StorageError>;

    /// Cache metadata for a certification, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn get_metadata(
        &self,
        certification_id: CertificationId,
    ) -> Result<Option<CacheMetadata>, StorageError>;

    /// Total cached questions across all certifications.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn total_cached(&self) -> Result<u32, StorageError>;

    /// Evicts the oldest-cached rows globally until at most `max_total`
    /// remain, recounting metadata in the same transaction. Returns the
    /// number of evicted rows.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot commit.
    async fn prune_lru(&self, max_total: u32) -> Result<u32, StorageError>;

    /// Deletes specific cached rows, recounting metadata.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot commit.
    async fn delete_questions(&self, ids: &[QuestionId]) -> Result<(), StorageError>;

    /// Removes a certification's cache and metadata together.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot commit.
    async fn clear_certification(
        &self,
        certification_id: CertificationId,
    ) -> Result<(), StorageError>;

    /// Purges every cached question and all metadata (logout path).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot commit.
    async fn clear_all(&self) -> Result<(), StorageError>;
}

/// Persistence contract for offline exam session state.
#[async_trait]
pub trait ExamStateRepository: Send + Sync {
    /// Persists the full exam state (header, question order, responses) in
    /// one transaction.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot commit.
    async fn upsert_exam(&self, exam: &OfflineExam) -> Result<(), StorageError>;

    /// Loads an exam by its client token.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query or rehydration failure.
    async fn get_exam(&self, id: ExamId) -> Result<Option<OfflineExam>, StorageError>;

    /// Deletes an exam and its question/response rows.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    async fn delete_exam(&self, id: ExamId) -> Result<(), StorageError>;

    /// Exams in a given status, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn list_by_status(
        &self,
        status: ExamStatus,
        limit: u32,
    ) -> Result<Vec<OfflineExam>, StorageError>;
}

/// Persistence contract for the durable outbound queue.
///
/// FIFO order is (created_at, insertion sequence); replacing an item by id
/// keeps its position so idempotent re-enqueues do not jump the line.
#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    /// Inserts a new item or replaces an existing one in place by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails.
    async fn upsert_item(&self, item: &SyncQueueItem) -> Result<(), StorageError>;

    /// Loads an item by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn get_item(&self, id: &QueueItemId) -> Result<Option<SyncQueueItem>, StorageError>;

    /// Pending items in FIFO order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn pending_in_order(&self, limit: u32) -> Result<Vec<SyncQueueItem>, StorageError>;

    /// Removes an item outright (synced, or terminally rejected).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    async fn delete_item(&self, id: &QueueItemId) -> Result<(), StorageError>;

    /// Number of pending items.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn count_pending(&self) -> Result<u32, StorageError>;

    /// Number of dead-letter items.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn count_dead_letter(&self) -> Result<u32, StorageError>;

    /// Evicts up to `count` of the oldest pending items; returns how many
    /// were actually removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete fails.
    async fn evict_oldest_pending(&self, count: u32) -> Result<u32, StorageError>;

    /// Records a failed attempt, bumping the retry count.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the item is gone.
    async fn record_failure(
        &self,
        id: &QueueItemId,
        retry_count: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Moves an item out of retry rotation permanently, recording the final
    /// retry count and error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the item is gone.
    async fn mark_dead_letter(
        &self,
        id: &QueueItemId,
        retry_count: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Dead-letter items, oldest first, for diagnostics.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on query failure.
    async fn dead_letter_items(&self, limit: u32) -> Result<Vec<SyncQueueItem>, StorageError>;
}

//
// ─── IN-MEMORY IMPLEMENTATION ──────────────────────────────────────────────────
//

struct QueueSlot {
    seq: u64,
    item: SyncQueueItem,
}

#[derive(Default)]
struct InMemoryState {
    questions: HashMap<QuestionId, CachedQuestion>,
    metadata: HashMap<CertificationId, CacheMetadata>,
    exams: HashMap<ExamId, OfflineExam>,
    queue: HashMap<QueueItemId, QueueSlot>,
    next_seq: u64,
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<Mutex<InMemoryState>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

fn recount_metadata(state: &mut InMemoryState) {
    let mut counts: HashMap<CertificationId, u32> = HashMap::new();
    for question in state.questions.values() {
        *counts.entry(question.certification_id()).or_insert(0) += 1;
    }
    let certs: Vec<CertificationId> = state.metadata.keys().copied().collect();
    for cert in certs {
        let count = counts.get(&cert).copied().unwrap_or(0);
        if let Some(meta) = state.metadata.get(&cert).copied() {
            state.metadata.insert(cert, meta.with_question_count(count));
        }
    }
}

#[async_trait]
impl QuestionCacheRepository for InMemoryRepository {
    async fn replace_certification(
        &self,
        certification_id: CertificationId,
        questions: &[CachedQuestion],
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state
            .questions
            .retain(|_, q| q.certification_id() != certification_id);
        for question in questions {
            state.questions.insert(question.id(), question.clone());
        }
        state.metadata.insert(certification_id, *metadata);
        // a question id stolen from another certification shifts its count
        recount_metadata(&mut state);
        Ok(())
    }

    async fn questions_for(
        &self,
        certification_id: CertificationId,
        filter: &QuestionFilter,
    ) -> Result<Vec<CachedQuestion>, StorageError> {
        let state = self.lock()?;
        let mut found: Vec<CachedQuestion> = state
            .questions
            .values()
            .filter(|q| q.certification_id() == certification_id && filter.matches(q))
            .cloned()
            .collect();
        found.sort_by_key(|q| q.id());
        Ok(found)
    }

    async fn get_questions(
        &self,
        ids: &[QuestionId],
    ) -> Result<Vec<CachedQuestion>, StorageError> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.questions.get(id).cloned())
            .collect())
    }

    async fn get_metadata(
        &self,
        certification_id: CertificationId,
    ) -> Result<Option<CacheMetadata>, StorageError> {
        let state = self.lock()?;
        Ok(state.metadata.get(&certification_id).copied())
    }

    async fn total_cached(&self) -> Result<u32, StorageError> {
        let state = self.lock()?;
        u32::try_from(state.questions.len())
            .map_err(|_| StorageError::Serialization("question count overflow".into()))
    }

    async fn prune_lru(&self, max_total: u32) -> Result<u32, StorageError> {
        let mut state = self.lock()?;
        let total = state.questions.len();
        let max = max_total as usize;
        if total <= max {
            return Ok(0);
        }
        let excess = total - max;
        let mut ordered: Vec<(DateTime<Utc>, QuestionId)> = state
            .questions
            .values()
            .map(|q| (q.cached_at(), q.id()))
            .collect();
        ordered.sort();
        for (_, id) in ordered.into_iter().take(excess) {
            state.questions.remove(&id);
        }
        recount_metadata(&mut state);
        u32::try_from(excess).map_err(|_| StorageError::Serialization("prune overflow".into()))
    }

    async fn delete_questions(&self, ids: &[QuestionId]) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        for id in ids {
            state.questions.remove(id);
        }
        recount_metadata(&mut state);
        Ok(())
    }

    async fn clear_certification(
        &self,
        certification_id: CertificationId,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state
            .questions
            .retain(|_, q| q.certification_id() != certification_id);
        state.metadata.remove(&certification_id);
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.questions.clear();
        state.metadata.clear();
        Ok(())
    }
}

#[async_trait]
impl ExamStateRepository for InMemoryRepository {
    async fn upsert_exam(&self, exam: &OfflineExam) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.exams.insert(exam.id(), exam.clone());
        Ok(())
    }

    async fn get_exam(&self, id: ExamId) -> Result<Option<OfflineExam>, StorageError> {
        let state = self.lock()?;
        Ok(state.exams.get(&id).cloned())
    }

    async fn delete_exam(&self, id: ExamId) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.exams.remove(&id);
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: ExamStatus,
        limit: u32,
    ) -> Result<Vec<OfflineExam>, StorageError> {
        let state = self.lock()?;
        let mut exams: Vec<OfflineExam> = state
            .exams
            .values()
            .filter(|e| e.status() == status)
            .cloned()
            .collect();
        exams.sort_by_key(|e| std::cmp::Reverse(e.last_updated_at()));
        exams.truncate(limit as usize);
        Ok(exams)
    }
}

fn pending_order(state: &InMemoryState) -> Vec<(DateTime<Utc>, u64, QueueItemId)> {
    let mut ordered: Vec<(DateTime<Utc>, u64, QueueItemId)> = state
        .queue
        .values()
        .filter(|slot| slot.item.status == QueueItemStatus::Pending)
        .map(|slot| (slot.item.created_at, slot.seq, slot.item.id.clone()))
        .collect();
    ordered.sort();
    ordered
}

#[async_trait]
impl SyncQueueRepository for InMemoryRepository {
    async fn upsert_item(&self, item: &SyncQueueItem) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if let Some(slot) = state.queue.get_mut(&item.id) {
            slot.item = item.clone();
            return Ok(());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert(
            item.id.clone(),
            QueueSlot {
                seq,
                item: item.clone(),
            },
        );
        Ok(())
    }

    async fn get_item(&self, id: &QueueItemId) -> Result<Option<SyncQueueItem>, StorageError> {
        let state = self.lock()?;
        Ok(state.queue.get(id).map(|slot| slot.item.clone()))
    }

    async fn pending_in_order(&self, limit: u32) -> Result<Vec<SyncQueueItem>, StorageError> {
        let state = self.lock()?;
        Ok(pending_order(&state)
            .into_iter()
            .take(limit as usize)
            .filter_map(|(_, _, id)| state.queue.get(&id).map(|slot| slot.item.clone()))
            .collect())
    }

    async fn delete_item(&self, id: &QueueItemId) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.queue.remove(id);
        Ok(())
    }

    async fn count_pending(&self) -> Result<u32, StorageError> {
        let state = self.lock()?;
        let count = state
            .queue
            .values()
            .filter(|slot| slot.item.status == QueueItemStatus::Pending)
            .count();
        u32::try_from(count).map_err(|_| StorageError::Serialization("count overflow".into()))
    }

    async fn count_dead_letter(&self) -> Result<u32, StorageError> {
        let state = self.lock()?;
        let count = state
            .queue
            .values()
            .filter(|slot| slot.item.status == QueueItemStatus::DeadLetter)
            .count();
        u32::try_from(count).map_err(|_| StorageError::Serialization("count overflow".into()))
    }

    async fn evict_oldest_pending(&self, count: u32) -> Result<u32, StorageError> {
        let mut state = self.lock()?;
        let victims: Vec<QueueItemId> = pending_order(&state)
            .into_iter()
            .take(count as usize)
            .map(|(_, _, id)| id)
            .collect();
        let evicted = victims.len();
        for id in victims {
            state.queue.remove(&id);
        }
        u32::try_from(evicted).map_err(|_| StorageError::Serialization("evict overflow".into()))
    }

    async fn record_failure(
        &self,
        id: &QueueItemId,
        retry_count: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let slot = state.queue.get_mut(id).ok_or(StorageError::NotFound)?;
        slot.item.retry_count = retry_count;
        slot.item.last_error = Some(error.to_string());
        slot.item.last_attempt_at = Some(at);
        Ok(())
    }

    async fn mark_dead_letter(
        &self,
        id: &QueueItemId,
        retry_count: u32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let slot = state.queue.get_mut(id).ok_or(StorageError::NotFound)?;
        slot.item.status = QueueItemStatus::DeadLetter;
        slot.item.retry_count = retry_count;
        slot.item.last_error = Some(error.to_string());
        slot.item.last_attempt_at = Some(at);
        Ok(())
    }

    async fn dead_letter_items(&self, limit: u32) -> Result<Vec<SyncQueueItem>, StorageError> {
        let state = self.lock()?;
        let mut ordered: Vec<(DateTime<Utc>, u64, SyncQueueItem)> = state
            .queue
            .values()
            .filter(|slot| slot.item.status == QueueItemStatus::DeadLetter)
            .map(|slot| (slot.item.created_at, slot.seq, slot.item.clone()))
            .collect();
        ordered.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(ordered
            .into_iter()
            .take(limit as usize)
            .map(|(_, _, item)| item)
            .collect())
    }
}

//
// ─── STORAGE AGGREGATE ─────────────────────────────────────────────────────────
//

/// Aggregates the repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub questions: Arc<dyn QuestionCacheRepository>,
    pub exams: Arc<dyn ExamStateRepository>,
    pub queue: Arc<dyn SyncQueueRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let questions: Arc<dyn QuestionCacheRepository> = Arc::new(repo.clone());
        let exams: Arc<dyn ExamStateRepository> = Arc::new(repo.clone());
        let queue: Arc<dyn SyncQueueRepository> = Arc::new(repo);
        Self {
            questions,
            exams,
            queue,
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
