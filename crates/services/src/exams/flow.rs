use std::collections::HashSet;
use std::sync::Arc;

use rand::rng;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{info, warn};

use exam_core::Clock;
use exam_core::model::{
    AnswerPayload, CachedQuestion, CertificationId, DEFAULT_EXAM_DURATION_SECS, ExamError,
    ExamId, ExamResponse, ExamScore, ExamStatus, ExamSubmissionPayload, OfflineExam,
    QuestionFilter, QuestionId, SessionKind,
};
use storage::repository::ExamStateRepository;

use crate::cache_service::CacheService;
use crate::error::ExamFlowError;
use crate::sync::SyncQueueService;

/// A freshly started session with its question material.
#[derive(Debug, Clone)]
pub struct StartedExam {
    pub exam: OfflineExam,
    pub questions: Vec<CachedQuestion>,
}

/// A session rejoined against the live cache.
#[derive(Debug, Clone)]
pub struct ResumedExam {
    pub exam: OfflineExam,
    pub questions: Vec<CachedQuestion>,
    pub remaining_seconds: u32,
    /// Questions silently evicted since the session started, surfaced so
    /// the UI can tell the user the exam shrank.
    pub dropped_questions: u32,
}

/// A submitted session with its provisional local score.
#[derive(Debug, Clone)]
pub struct SubmittedExam {
    pub exam: OfflineExam,
    pub score: ExamScore,
}

/// Drives offline exam and practice sessions from local state alone.
///
/// Every mutation is persisted before returning, so the session survives
/// reloads, restarts, and arbitrary offline duration.
pub struct ExamFlowService {
    clock: Clock,
    cache: Arc<CacheService>,
    exams: Arc<dyn ExamStateRepository>,
    queue: Arc<SyncQueueService>,
    exam_duration_secs: u32,
    // single-writer guard: a timer auto-submit and a manual submit must not
    // both run completion for the same exam
    submitting: Mutex<HashSet<ExamId>>,
}

impl ExamFlowService {
    #[must_use]
    pub fn new(
        clock: Clock,
        cache: Arc<CacheService>,
        exams: Arc<dyn ExamStateRepository>,
        queue: Arc<SyncQueueService>,
    ) -> Self {
        Self {
            clock,
            cache,
            exams,
            queue,
            exam_duration_secs: DEFAULT_EXAM_DURATION_SECS,
            submitting: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn with_duration_secs(mut self, exam_duration_secs: u32) -> Self {
        self.exam_duration_secs = exam_duration_secs;
        self
    }

    #[must_use]
    pub fn exam_duration_secs(&self) -> u32 {
        self.exam_duration_secs
    }

    async fn load(&self, exam_id: ExamId) -> Result<OfflineExam, ExamFlowError> {
        self.exams
            .get_exam(exam_id)
            .await?
            .ok_or(ExamFlowError::NotFound(exam_id))
    }

    /// Starts a new offline session from the cached question set.
    ///
    /// Requires a valid unexpired cache; selects up to `desired_count`
    /// questions, shuffled, and persists the new in-progress state.
    ///
    /// # Errors
    ///
    /// Returns `ExamFlowError::NoUsableCache` if the certification cannot
    /// back an offline session, or a cache/storage error.
    pub async fn start(
        &self,
        certification_id: CertificationId,
        kind: SessionKind,
        desired_count: u32,
    ) -> Result<StartedExam, ExamFlowError> {
        if !self.cache.offline_ready(certification_id).await? {
            return Err(ExamFlowError::NoUsableCache(certification_id));
        }

        let mut questions = self
            .cache
            .read(certification_id, &QuestionFilter::any())
            .await?;
        if questions.is_empty() {
            return Err(ExamFlowError::NoUsableCache(certification_id));
        }

        questions.shuffle(&mut rng());
        questions.truncate(desired_count as usize);

        let now = self.clock.now();
        let question_ids: Vec<QuestionId> = questions.iter().map(CachedQuestion::id).collect();
        let exam = OfflineExam::start(
            ExamId::generate(),
            certification_id,
            kind,
            question_ids,
            now,
        )?;
        self.exams.upsert_exam(&exam).await?;

        info!(
            exam = %exam.id(),
            certification = %certification_id,
            %kind,
            count = exam.question_count(),
            "offline session started"
        );
        Ok(StartedExam { exam, questions })
    }

    /// Records an answer, overwriting any prior selection, and persists
    /// immediately. Practice answers are additionally queued for sync under
    /// their deterministic id so edits collapse into one outbound item.
    ///
    /// # Errors
    ///
    /// Fails closed with `ExamFlowError::Exam` on invalid state, or returns
    /// a storage/queue error.
    pub async fn answer_question(
        &self,
        exam_id: ExamId,
        question_id: QuestionId,
        selected: Vec<u32>,
    ) -> Result<OfflineExam, ExamFlowError> {
        let now = self.clock.now();
        let mut exam = self.load(exam_id).await?;
        exam.answer(question_id, selected.clone(), now)?;
        self.exams.upsert_exam(&exam).await?;

        if exam.kind() == SessionKind::Practice {
            self.queue
                .enqueue_answer(&AnswerPayload {
                    exam_id,
                    certification_id: exam.certification_id(),
                    kind: exam.kind().into(),
                    question_count: exam.question_count(),
                    question_id,
                    selected_answers: selected,
                    time_spent_seconds: exam.time_spent_seconds(),
                })
                .await?;
        }
        Ok(exam)
    }

    /// Moves the cursor; persisted so resume reopens at the same question.
    ///
    /// # Errors
    ///
    /// Fails closed with `ExamFlowError::Exam` on an out-of-bounds index or
    /// terminal state, or returns a storage error.
    pub async fn navigate(
        &self,
        exam_id: ExamId,
        index: u32,
    ) -> Result<OfflineExam, ExamFlowError> {
        let now = self.clock.now();
        let mut exam = self.load(exam_id).await?;
        exam.navigate(index, now)?;
        self.exams.upsert_exam(&exam).await?;
        Ok(exam)
    }

    /// Adds to the session's cumulative time spent.
    ///
    /// # Errors
    ///
    /// Fails closed with `ExamFlowError::Exam` on terminal state, or
    /// returns a storage error.
    pub async fn record_time(
        &self,
        exam_id: ExamId,
        seconds: u32,
    ) -> Result<OfflineExam, ExamFlowError> {
        let now = self.clock.now();
        let mut exam = self.load(exam_id).await?;
        exam.record_time(seconds, now)?;
        self.exams.upsert_exam(&exam).await?;
        Ok(exam)
    }

    /// Submits the session: grades locally against the cached correct
    /// answers, queues exactly one full-exam item, and marks the exam
    /// completed. The state is **not** deleted here; it survives until the
    /// queued submission is confirmed synced, so a crash mid-submit leaves
    /// a resumable session.
    ///
    /// # Errors
    ///
    /// Returns `ExamFlowError::SubmissionInProgress` when another submit
    /// holds the guard, fails closed on terminal state, or surfaces a
    /// storage/queue error.
    pub async fn submit(&self, exam_id: ExamId) -> Result<SubmittedExam, ExamFlowError> {
        {
            let mut guard = self.submitting.lock().await;
            if !guard.insert(exam_id) {
                return Err(ExamFlowError::SubmissionInProgress(exam_id));
            }
        }
        let result = self.submit_inner(exam_id).await;
        self.submitting.lock().await.remove(&exam_id);
        result
    }

    async fn submit_inner(&self, exam_id: ExamId) -> Result<SubmittedExam, ExamFlowError> {
        let now = self.clock.now();
        let mut exam = self.load(exam_id).await?;
        if exam.status() != ExamStatus::InProgress {
            return Err(ExamFlowError::Exam(ExamError::NotInProgress(exam.status())));
        }

        let questions = self.cache.questions_by_ids(exam.question_ids()).await?;
        let score = exam.grade(&questions);

        let responses: Vec<ExamResponse> = exam
            .responses()
            .into_iter()
            .map(|(question_id, selected_answers)| {
                let correct = questions
                    .iter()
                    .find(|q| q.id() == question_id)
                    .is_some_and(|q| q.is_correct_selection(&selected_answers));
                ExamResponse {
                    question_id,
                    selected_answers,
                    correct,
                }
            })
            .collect();

        let payload = ExamSubmissionPayload {
            client_token: exam.id(),
            certification_id: exam.certification_id(),
            kind: exam.kind().into(),
            responses,
            question_count: score.total,
            correct_count: score.correct,
            total_time_seconds: exam.time_spent_seconds(),
            started_at: exam.started_at(),
            completed_at: now,
        };

        // queue first: if the process dies before the completed state is
        // written the session is still in progress locally, and the queued
        // submission will be confirmed (and the state released) on flush
        self.queue.enqueue_exam_submission(&payload).await?;
        exam.complete(now)?;
        self.exams.upsert_exam(&exam).await?;

        info!(
            exam = %exam.id(),
            correct = score.correct,
            total = score.total,
            "offline exam queued for sync"
        );
        Ok(SubmittedExam { exam, score })
    }

    /// Timer path: submits only when the fixed duration has fully elapsed.
    /// Returns `None` (a no-op) when time remains, the exam is already
    /// terminal, or another submit holds the guard.
    ///
    /// # Errors
    ///
    /// Returns storage/queue errors from the underlying submit.
    pub async fn submit_if_expired(
        &self,
        exam_id: ExamId,
    ) -> Result<Option<SubmittedExam>, ExamFlowError> {
        let now = self.clock.now();
        let exam = self.load(exam_id).await?;
        if exam.status() != ExamStatus::InProgress {
            return Ok(None);
        }
        if exam.remaining_seconds(self.exam_duration_secs, now) > 0 {
            return Ok(None);
        }
        match self.submit(exam_id).await {
            Ok(submitted) => Ok(Some(submitted)),
            Err(ExamFlowError::SubmissionInProgress(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Explicitly discards a session. Deletes the state and queues nothing.
    ///
    /// # Errors
    ///
    /// Fails closed with `ExamFlowError::Exam` if the exam is already
    /// terminal, or returns a storage error.
    pub async fn abandon(&self, exam_id: ExamId) -> Result<(), ExamFlowError> {
        let now = self.clock.now();
        let mut exam = self.load(exam_id).await?;
        exam.abandon(now)?;
        self.exams.delete_exam(exam_id).await?;
        info!(exam = %exam_id, "offline session abandoned");
        Ok(())
    }

    /// Rejoins a stored in-progress session against the current cache.
    ///
    /// Question ids whose rows were evicted are filtered rather than
    /// failing the session; if none survive the resume fails explicitly and
    /// abandonment is the only remaining path. Remaining time is recomputed
    /// from the fixed duration and the original start.
    ///
    /// # Errors
    ///
    /// Returns `ExamFlowError::NotResumable` for terminal sessions and
    /// `ExamFlowError::QuestionsUnavailable` when the cache has nothing
    /// left, or a storage error.
    pub async fn resume(&self, exam_id: ExamId) -> Result<ResumedExam, ExamFlowError> {
        let now = self.clock.now();
        let mut exam = self.load(exam_id).await?;
        if exam.status() != ExamStatus::InProgress {
            return Err(ExamFlowError::NotResumable(exam.status()));
        }

        let questions = self.cache.questions_by_ids(exam.question_ids()).await?;
        let available: HashSet<QuestionId> = questions.iter().map(CachedQuestion::id).collect();

        let before = exam.question_count();
        let survivors = exam.retain_questions(&available);
        if survivors == 0 {
            return Err(ExamFlowError::QuestionsUnavailable(exam_id));
        }

        let dropped_questions = before - exam.question_count();
        if dropped_questions > 0 {
            warn!(
                exam = %exam_id,
                dropped = dropped_questions,
                "resumed with evicted questions filtered out"
            );
            self.exams.upsert_exam(&exam).await?;
        }

        let remaining_seconds = exam.remaining_seconds(self.exam_duration_secs, now);
        Ok(ResumedExam {
            exam,
            questions,
            remaining_seconds,
            dropped_questions,
        })
    }

    /// In-progress sessions available to resume, optionally narrowed to one
    /// certification.
    ///
    /// # Errors
    ///
    /// Returns a storage error on repository failure.
    pub async fn resumable(
        &self,
        certification_id: Option<CertificationId>,
        limit: u32,
    ) -> Result<Vec<OfflineExam>, ExamFlowError> {
        let exams = self
            .exams
            .list_by_status(ExamStatus::InProgress, limit)
            .await?;
        Ok(match certification_id {
            Some(certification_id) => exams
                .into_iter()
                .filter(|exam| exam.certification_id() == certification_id)
                .collect(),
            None => exams,
        })
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
