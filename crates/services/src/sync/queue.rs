use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use exam_core::Clock;
use exam_core::model::{
    AnswerPayload, ExamId, ExamSubmissionPayload, QuestionId, QueueItemId, QueueItemKind,
    ReviewPayload, SessionKind, SyncQueueItem,
};
use storage::repository::{ExamStateRepository, SyncQueueRepository};

use crate::api::{
    AnswerUpload, ApiError, CreateSessionRequest, ExamApi, ResponseUpload, ReviewUpload,
    SessionCompletion,
};
use crate::error::SyncQueueError;
use crate::host::HostPlatform;
use crate::sync::backoff::{RETRY_CEILING, backoff_delay};

/// Queue capacity; at the cap the oldest pending items are evicted to admit
/// new ones, favoring availability over completeness.
pub const DEFAULT_QUEUE_CAPACITY: u32 = 500;

/// Aggregate result of a flush. Individual item failures never throw; they
/// land in `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub synced: u32,
    pub failed: u32,
}

/// Durable FIFO of outbound mutations: answers, review ratings, and
/// full-exam submissions.
#[derive(Clone)]
pub struct SyncQueueService {
    clock: Clock,
    queue: Arc<dyn SyncQueueRepository>,
    exams: Arc<dyn ExamStateRepository>,
    api: Arc<dyn ExamApi>,
    host: Arc<dyn HostPlatform>,
    capacity: u32,
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl AttemptError {
    fn is_terminal(&self) -> bool {
        match self {
            AttemptError::Api(error) => error.is_terminal(),
            AttemptError::Payload(_) => true,
        }
    }
}

impl SyncQueueService {
    #[must_use]
    pub fn new(
        clock: Clock,
        queue: Arc<dyn SyncQueueRepository>,
        exams: Arc<dyn ExamStateRepository>,
        api: Arc<dyn ExamApi>,
        host: Arc<dyn HostPlatform>,
    ) -> Self {
        Self {
            clock,
            queue,
            exams,
            api,
            host,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Enqueues a mutation. An `id_key` matching an existing item replaces
    /// it in place (same queue position, retry count reset); otherwise the
    /// item is appended, evicting the oldest pending items at capacity.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError::Storage` if the write fails.
    pub async fn enqueue(
        &self,
        kind: QueueItemKind,
        payload: serde_json::Value,
        id_key: Option<QueueItemId>,
    ) -> Result<QueueItemId, SyncQueueError> {
        let id = id_key.unwrap_or_else(|| QueueItemId::unique(kind));

        if let Some(existing) = self.queue.get_item(&id).await? {
            // collapse the edit: latest payload wins, retries start over
            let replacement = SyncQueueItem::new(id.clone(), kind, payload, existing.created_at);
            self.queue.upsert_item(&replacement).await?;
            debug!(item = %id, "replaced queued item in place");
            return Ok(id);
        }

        let pending = self.queue.count_pending().await?;
        if pending >= self.capacity {
            let overflow = pending - self.capacity + 1;
            let evicted = self.queue.evict_oldest_pending(overflow).await?;
            warn!(evicted, capacity = self.capacity, "sync queue full, evicted oldest");
        }

        let item = SyncQueueItem::new(id.clone(), kind, payload, self.clock.now());
        self.queue.upsert_item(&item).await?;
        Ok(id)
    }

    /// Queues a practice answer under its deterministic id, so editing the
    /// same answer before a flush yields exactly one item.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if encoding or the write fails.
    pub async fn enqueue_answer(
        &self,
        payload: &AnswerPayload,
    ) -> Result<QueueItemId, SyncQueueError> {
        let id = QueueItemId::for_answer(payload.exam_id, payload.question_id);
        self.enqueue(QueueItemKind::Answer, serde_json::to_value(payload)?, Some(id))
            .await
    }

    /// Queues a review quality rating (a distinct event, unique id).
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError::Review` for an out-of-range quality, or a
    /// storage/encoding error.
    pub async fn enqueue_review(
        &self,
        question_id: QuestionId,
        quality: u8,
    ) -> Result<QueueItemId, SyncQueueError> {
        let payload = ReviewPayload::new(question_id, quality)?;
        self.enqueue(QueueItemKind::Review, serde_json::to_value(payload)?, None)
            .await
    }

    /// Queues a completed offline exam under its client token.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError` if encoding or the write fails.
    pub async fn enqueue_exam_submission(
        &self,
        payload: &ExamSubmissionPayload,
    ) -> Result<QueueItemId, SyncQueueError> {
        let id = QueueItemId::for_exam_submission(payload.client_token);
        self.enqueue(
            QueueItemKind::FullExam,
            serde_json::to_value(payload)?,
            Some(id),
        )
        .await
    }

    /// Pending items awaiting sync, for the UI badge.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError::Storage` on repository failure.
    pub async fn pending_count(&self) -> Result<u32, SyncQueueError> {
        Ok(self.queue.count_pending().await?)
    }

    /// Items that exhausted their retry budget.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError::Storage` on repository failure.
    pub async fn dead_letter_count(&self) -> Result<u32, SyncQueueError> {
        Ok(self.queue.count_dead_letter().await?)
    }

    /// Drains the queue against the remote API.
    ///
    /// No-op while offline. Answer items go first so their server sessions
    /// exist before anything else referencing them; a server session is
    /// created at most once per local exam per flush. A 2xx removes the
    /// item, a 4xx removes it without retry, and anything else retries with
    /// backoff until the ceiling moves the item to dead letter.
    ///
    /// # Errors
    ///
    /// Returns `SyncQueueError::Storage` only for store faults; per-item
    /// failures are folded into the report.
    pub async fn flush(&self) -> Result<FlushReport, SyncQueueError> {
        if !self.host.is_online() {
            debug!("offline, flush skipped");
            return Ok(FlushReport::default());
        }

        // Re-derive the work list from the store every time: another writer
        // may share it, and store-level atomicity is the only cross-writer
        // guarantee.
        let pending = self.queue.pending_in_order(u32::MAX).await?;
        if pending.is_empty() {
            return Ok(FlushReport::default());
        }

        let (answers, rest): (Vec<SyncQueueItem>, Vec<SyncQueueItem>) = pending
            .into_iter()
            .partition(|item| item.kind == QueueItemKind::Answer);

        let mut sessions: HashMap<ExamId, String> = HashMap::new();
        let mut report = FlushReport::default();
        for item in answers.into_iter().chain(rest) {
            if self.sync_item(&item, &mut sessions).await? {
                report.synced += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(synced = report.synced, failed = report.failed, "sync queue flushed");
        Ok(report)
    }

    /// Pushes one item until it succeeds, is rejected, or runs out of
    /// retries. Retries for a single item are strictly sequential.
    async fn sync_item(
        &self,
        item: &SyncQueueItem,
        sessions: &mut HashMap<ExamId, String>,
    ) -> Result<bool, SyncQueueError> {
        let mut retry_count = item.retry_count;
        loop {
            match self.attempt(item, sessions).await {
                Ok(()) => {
                    self.confirm(item).await?;
                    return Ok(true);
                }
                Err(error) if error.is_terminal() => {
                    warn!(item = %item.id, %error, "permanent rejection, dropping item");
                    self.queue.delete_item(&item.id).await?;
                    return Ok(false);
                }
                Err(error) => {
                    retry_count += 1;
                    let now = self.clock.now();
                    if retry_count >= RETRY_CEILING {
                        warn!(item = %item.id, retry_count, "retry budget exhausted, dead-lettering");
                        self.queue
                            .mark_dead_letter(&item.id, retry_count, &error.to_string(), now)
                            .await?;
                        return Ok(false);
                    }
                    self.queue
                        .record_failure(&item.id, retry_count, &error.to_string(), now)
                        .await?;
                    tokio::time::sleep(backoff_delay(retry_count)).await;
                }
            }
        }
    }

    /// A 2xx confirms the item; a confirmed full-exam submission also
    /// releases the local exam state that was held back for crash safety.
    async fn confirm(&self, item: &SyncQueueItem) -> Result<(), SyncQueueError> {
        self.queue.delete_item(&item.id).await?;
        if item.kind == QueueItemKind::FullExam {
            if let Ok(payload) =
                serde_json::from_value::<ExamSubmissionPayload>(item.payload.clone())
            {
                self.exams.delete_exam(payload.client_token).await?;
                debug!(exam = %payload.client_token, "submission confirmed, local exam state deleted");
            }
        }
        Ok(())
    }

    async fn attempt(
        &self,
        item: &SyncQueueItem,
        sessions: &mut HashMap<ExamId, String>,
    ) -> Result<(), AttemptError> {
        match item.kind {
            QueueItemKind::Answer => {
                let payload: AnswerPayload = serde_json::from_value(item.payload.clone())?;
                let session_id = self
                    .ensure_session(
                        sessions,
                        payload.exam_id,
                        CreateSessionRequest {
                            certification_id: payload.certification_id,
                            session_type: SessionKind::from(payload.kind).as_str().to_string(),
                            topic_id: None,
                            domain_id: None,
                            question_count: payload.question_count,
                        },
                    )
                    .await?;
                self.api
                    .submit_answer(
                        &session_id,
                        &AnswerUpload {
                            question_id: payload.question_id,
                            selected_answers: payload.selected_answers,
                            time_spent_seconds: payload.time_spent_seconds,
                        },
                    )
                    .await?;
            }
            QueueItemKind::Review => {
                let payload: ReviewPayload = serde_json::from_value(item.payload.clone())?;
                self.api
                    .submit_review(&ReviewUpload {
                        question_id: payload.question_id,
                        quality: payload.quality,
                    })
                    .await?;
            }
            QueueItemKind::FullExam => {
                let payload: ExamSubmissionPayload =
                    serde_json::from_value(item.payload.clone())?;
                let session_id = self
                    .ensure_session(
                        sessions,
                        payload.client_token,
                        CreateSessionRequest {
                            certification_id: payload.certification_id,
                            session_type: SessionKind::from(payload.kind).as_str().to_string(),
                            topic_id: None,
                            domain_id: None,
                            question_count: payload.question_count,
                        },
                    )
                    .await?;
                let completion = SessionCompletion {
                    client_token: payload.client_token.to_string(),
                    responses: payload
                        .responses
                        .iter()
                        .map(|r| ResponseUpload {
                            question_id: r.question_id,
                            selected_answers: r.selected_answers.clone(),
                            correct: r.correct,
                        })
                        .collect(),
                    question_count: payload.question_count,
                    correct_count: payload.correct_count,
                    total_time_seconds: payload.total_time_seconds,
                    started_at: payload.started_at,
                    completed_at: payload.completed_at,
                };
                self.api.complete_session(&session_id, &completion).await?;
            }
        }
        Ok(())
    }

    /// Creates the server-side session for a local exam at most once per
    /// flush, memoized by the client token.
    async fn ensure_session(
        &self,
        sessions: &mut HashMap<ExamId, String>,
        exam_id: ExamId,
        request: CreateSessionRequest,
    ) -> Result<String, ApiError> {
        if let Some(session_id) = sessions.get(&exam_id) {
            return Ok(session_id.clone());
        }
        let created = self.api.create_session(&request).await?;
        debug!(exam = %exam_id, session = %created.session_id, "server session created");
        sessions.insert(exam_id, created.session_id.clone());
        Ok(created.session_id)
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use exam_core::model::{CertificationId, SessionKindTag};
    use exam_core::time::{fixed_clock, fixed_now};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use storage::repository::InMemoryRepository;

    use crate::api::{RemoteQuestion, SessionCreated};
    use crate::host::ManualHost;

    #[derive(Default)]
    struct ScriptedApi {
        review_script: Mutex<VecDeque<Result<(), ApiError>>>,
        answer_script: Mutex<VecDeque<Result<(), ApiError>>>,
        complete_script: Mutex<VecDeque<Result<(), ApiError>>>,
        sessions_created: AtomicU32,
        review_attempts: AtomicU32,
        answers: Mutex<Vec<(String, AnswerUpload)>>,
        completions: Mutex<Vec<(String, SessionCompletion)>>,
    }

    impl ScriptedApi {
        fn always_ok() -> Self {
            Self::default()
        }

        fn reviews(script: Vec<Result<(), ApiError>>) -> Self {
            Self {
                review_script: Mutex::new(script.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ExamApi for ScriptedApi {
        async fn fetch_questions(
            &self,
            _certification_id: CertificationId,
            _limit: u32,
        ) -> Result<Vec<RemoteQuestion>, ApiError> {
            unimplemented!("not used by queue tests")
        }

        async fn create_session(
            &self,
            _request: &CreateSessionRequest,
        ) -> Result<SessionCreated, ApiError> {
            let n = self.sessions_created.fetch_add(1, Ordering::SeqCst);
            Ok(SessionCreated {
                session_id: format!("srv-{n}"),
            })
        }

        async fn submit_answer(
            &self,
            session_id: &str,
            answer: &AnswerUpload,
        ) -> Result<(), ApiError> {
            let scripted = self.answer_script.lock().unwrap().pop_front();
            if let Some(result) = scripted {
                result?;
            }
            self.answers
                .lock()
                .unwrap()
                .push((session_id.to_string(), answer.clone()));
            Ok(())
        }

        async fn submit_review(&self, _review: &ReviewUpload) -> Result<(), ApiError> {
            self.review_attempts.fetch_add(1, Ordering::SeqCst);
            match self.review_script.lock().unwrap().pop_front() {
                Some(result) => result,
                None => Ok(()),
            }
        }

        async fn complete_session(
            &self,
            session_id: &str,
            completion: &SessionCompletion,
        ) -> Result<(), ApiError> {
            let scripted = self.complete_script.lock().unwrap().pop_front();
            if let Some(result) = scripted {
                result?;
            }
            self.completions
                .lock()
                .unwrap()
                .push((session_id.to_string(), completion.clone()));
            Ok(())
        }
    }

    fn build_service(api: Arc<ScriptedApi>, online: bool) -> (SyncQueueService, InMemoryRepository) {
        let repo = InMemoryRepository::new();
        let host = Arc::new(ManualHost::new(online));
        let service = SyncQueueService::new(
            fixed_clock(),
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            api,
            host,
        );
        (service, repo)
    }

    fn answer_payload(exam_id: ExamId, question: u64, selected: Vec<u32>) -> AnswerPayload {
        AnswerPayload {
            exam_id,
            certification_id: CertificationId::new(1),
            kind: SessionKindTag::Practice,
            question_count: 10,
            question_id: QuestionId::new(question),
            selected_answers: selected,
            time_spent_seconds: 30,
        }
    }

    #[tokio::test]
    async fn repeated_answer_edits_collapse_to_one_item() {
        let api = Arc::new(ScriptedApi::always_ok());
        let (service, _repo) = build_service(Arc::clone(&api), true);
        let exam_id = ExamId::generate();

        service
            .enqueue_answer(&answer_payload(exam_id, 7, vec![0]))
            .await
            .unwrap();
        service
            .enqueue_answer(&answer_payload(exam_id, 7, vec![1, 2]))
            .await
            .unwrap();

        assert_eq!(service.pending_count().await.unwrap(), 1);

        let report = service.flush().await.unwrap();
        assert_eq!(report, FlushReport { synced: 1, failed: 0 });

        let answers = api.answers.lock().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].1.selected_answers, vec![1, 2]);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest_pending() {
        let api = Arc::new(ScriptedApi::always_ok());
        let (service, repo) = build_service(api, false);
        let service = service.with_capacity(500);

        for i in 0..501_u32 {
            service
                .enqueue(
                    QueueItemKind::Review,
                    serde_json::json!({"n": i}),
                    Some(QueueItemId::new(format!("review:{i:04}"))),
                )
                .await
                .unwrap();
        }

        assert_eq!(service.pending_count().await.unwrap(), 500);
        let pending = repo.pending_in_order(u32::MAX).await.unwrap();
        assert_eq!(pending[0].id.as_str(), "review:0001");
        assert_eq!(pending.last().unwrap().id.as_str(), "review:0500");
    }

    #[tokio::test]
    async fn flush_is_a_noop_while_offline() {
        let api = Arc::new(ScriptedApi::always_ok());
        let (service, _repo) = build_service(Arc::clone(&api), false);

        service
            .enqueue_review(QuestionId::new(1), 4)
            .await
            .unwrap();
        let report = service.flush().await.unwrap();

        assert_eq!(report, FlushReport::default());
        assert_eq!(service.pending_count().await.unwrap(), 1);
        assert_eq!(api.review_attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_422_is_terminal_after_one_attempt() {
        let api = Arc::new(ScriptedApi::reviews(vec![Err(ApiError::Status(
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
        ))]));
        let (service, _repo) = build_service(Arc::clone(&api), true);

        service
            .enqueue_review(QuestionId::new(1), 3)
            .await
            .unwrap();
        let report = service.flush().await.unwrap();

        assert_eq!(report, FlushReport { synced: 0, failed: 1 });
        assert_eq!(api.review_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(service.pending_count().await.unwrap(), 0);
        assert_eq!(service.dead_letter_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn a_503_is_retried_until_it_succeeds() {
        let api = Arc::new(ScriptedApi::reviews(vec![
            Err(ApiError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE)),
            Err(ApiError::Network("connection reset".into())),
            Ok(()),
        ]));
        let (service, _repo) = build_service(Arc::clone(&api), true);

        service
            .enqueue_review(QuestionId::new(1), 3)
            .await
            .unwrap();
        let report = service.flush().await.unwrap();

        assert_eq!(report, FlushReport { synced: 1, failed: 0 });
        assert_eq!(api.review_attempts.load(Ordering::SeqCst), 3);
        assert_eq!(service.pending_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn the_fifth_failure_dead_letters_the_item() {
        let api = Arc::new(ScriptedApi::reviews(
            (0..5)
                .map(|_| Err(ApiError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE)))
                .collect(),
        ));
        let (service, repo) = build_service(Arc::clone(&api), true);

        service
            .enqueue_review(QuestionId::new(1), 3)
            .await
            .unwrap();
        let report = service.flush().await.unwrap();

        assert_eq!(report, FlushReport { synced: 0, failed: 1 });
        assert_eq!(api.review_attempts.load(Ordering::SeqCst), 5);
        assert_eq!(service.pending_count().await.unwrap(), 0);
        assert_eq!(service.dead_letter_count().await.unwrap(), 1);

        let dead = repo.dead_letter_items(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, RETRY_CEILING);
        assert!(dead[0].last_error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn one_server_session_per_exam_per_flush() {
        let api = Arc::new(ScriptedApi::always_ok());
        let (service, _repo) = build_service(Arc::clone(&api), true);
        let exam_id = ExamId::generate();

        service
            .enqueue_answer(&answer_payload(exam_id, 1, vec![0]))
            .await
            .unwrap();
        service
            .enqueue_answer(&answer_payload(exam_id, 2, vec![1]))
            .await
            .unwrap();
        service
            .enqueue_review(QuestionId::new(9), 5)
            .await
            .unwrap();

        let report = service.flush().await.unwrap();
        assert_eq!(report, FlushReport { synced: 3, failed: 0 });
        assert_eq!(api.sessions_created.load(Ordering::SeqCst), 1);

        let answers = api.answers.lock().unwrap();
        assert_eq!(answers.len(), 2);
        assert!(answers.iter().all(|(session, _)| session == "srv-0"));
    }

    #[tokio::test]
    async fn confirmed_submission_releases_exam_state() {
        use exam_core::model::{ExamResponse, OfflineExam, SessionKind};

        let api = Arc::new(ScriptedApi::always_ok());
        let (service, repo) = build_service(Arc::clone(&api), true);
        let now = fixed_now();

        let mut exam = OfflineExam::start(
            ExamId::generate(),
            CertificationId::new(1),
            SessionKind::Exam,
            vec![QuestionId::new(1)],
            now,
        )
        .unwrap();
        exam.answer(QuestionId::new(1), vec![0], now).unwrap();
        exam.complete(now).unwrap();
        repo.upsert_exam(&exam).await.unwrap();

        let payload = ExamSubmissionPayload {
            client_token: exam.id(),
            certification_id: exam.certification_id(),
            kind: SessionKindTag::Exam,
            responses: vec![ExamResponse {
                question_id: QuestionId::new(1),
                selected_answers: vec![0],
                correct: true,
            }],
            question_count: 1,
            correct_count: 1,
            total_time_seconds: 60,
            started_at: now,
            completed_at: now,
        };
        service.enqueue_exam_submission(&payload).await.unwrap();

        let report = service.flush().await.unwrap();
        assert_eq!(report, FlushReport { synced: 1, failed: 0 });
        assert_eq!(api.completions.lock().unwrap().len(), 1);
        assert!(repo.get_exam(exam.id()).await.unwrap().is_none());
    }
}
