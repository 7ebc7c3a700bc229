use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use exam_core::Clock;
use exam_core::model::{
    CacheMetadata, CachedQuestion, CertificationId, Difficulty, QuestionFilter, QuestionId,
};
use storage::repository::QuestionCacheRepository;

use crate::api::{ExamApi, RemoteQuestion};
use crate::error::CacheError;

/// Global bound on cached questions across all certifications.
pub const DEFAULT_CACHE_CAPACITY: u32 = 500;

/// User-facing freshness of a certification's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Unexpired and non-empty; offline sessions can start.
    Ready,
    /// Rows exist but the TTL has lapsed (or the last refresh failed).
    Stale,
    /// Nothing cached.
    Empty,
}

/// Downloads and maintains the bounded, expiring question working set.
#[derive(Clone)]
pub struct CacheService {
    clock: Clock,
    api: Arc<dyn ExamApi>,
    questions: Arc<dyn QuestionCacheRepository>,
}

impl CacheService {
    #[must_use]
    pub fn new(
        clock: Clock,
        api: Arc<dyn ExamApi>,
        questions: Arc<dyn QuestionCacheRepository>,
    ) -> Self {
        Self {
            clock,
            api,
            questions,
        }
    }

    /// Downloads up to `count` questions and replaces the certification's
    /// cache. The swap happens only after the fetch succeeds, in one storage
    /// transaction, so a failed download leaves the prior cache intact.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Fetch`/`EmptyDownload` without touching the
    /// existing cache, or `CacheError::Storage` if the swap cannot commit.
    pub async fn refresh(
        &self,
        certification_id: CertificationId,
        count: u32,
    ) -> Result<CacheMetadata, CacheError> {
        let fetched = self
            .api
            .fetch_questions(certification_id, count)
            .await
            .map_err(CacheError::Fetch)?;
        if fetched.is_empty() {
            return Err(CacheError::EmptyDownload(certification_id));
        }

        let now = self.clock.now();
        let mut questions = Vec::with_capacity(fetched.len());
        for remote in fetched {
            questions.push(cached_from_remote(remote, now)?);
        }

        let question_count = u32::try_from(questions.len()).unwrap_or(u32::MAX);
        let metadata = CacheMetadata::new(certification_id, question_count, now);
        self.questions
            .replace_certification(certification_id, &questions, &metadata)
            .await?;

        let evicted = self.questions.prune_lru(DEFAULT_CACHE_CAPACITY).await?;
        if evicted > 0 {
            debug!(evicted, "cache over capacity after refresh, pruned oldest");
        }
        info!(
            certification = %certification_id,
            count = question_count,
            "question cache refreshed"
        );
        Ok(metadata)
    }

    /// Unexpired cached questions, narrowed by the filter.
    ///
    /// Expiry is checked lazily here: an expired cache reads as empty while
    /// its rows stay on disk until a refresh, clear, or prune removes them.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on repository failure.
    pub async fn read(
        &self,
        certification_id: CertificationId,
        filter: &QuestionFilter,
    ) -> Result<Vec<CachedQuestion>, CacheError> {
        let now = self.clock.now();
        match self.questions.get_metadata(certification_id).await? {
            None => Ok(Vec::new()),
            Some(metadata) if metadata.is_expired(now) => {
                debug!(certification = %certification_id, "cache expired, read returns empty");
                Ok(Vec::new())
            }
            Some(_) => Ok(self.questions.questions_for(certification_id, filter).await?),
        }
    }

    /// Whether this certification can back an offline session right now.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on repository failure.
    pub async fn offline_ready(
        &self,
        certification_id: CertificationId,
    ) -> Result<bool, CacheError> {
        let now = self.clock.now();
        Ok(self
            .questions
            .get_metadata(certification_id)
            .await?
            .is_some_and(|metadata| metadata.is_usable(now)))
    }

    /// Freshness summary for display next to each certification.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on repository failure.
    pub async fn status(
        &self,
        certification_id: CertificationId,
    ) -> Result<CacheStatus, CacheError> {
        let now = self.clock.now();
        Ok(match self.questions.get_metadata(certification_id).await? {
            None => CacheStatus::Empty,
            Some(metadata) if metadata.question_count() == 0 => CacheStatus::Empty,
            Some(metadata) if metadata.is_expired(now) => CacheStatus::Stale,
            Some(_) => CacheStatus::Ready,
        })
    }

    /// Evicts the least-recently-cached rows globally down to `max_total`.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on repository failure.
    pub async fn prune(&self, max_total: u32) -> Result<u32, CacheError> {
        let evicted = self.questions.prune_lru(max_total).await?;
        if evicted > 0 {
            info!(evicted, max_total, "pruned question cache");
        }
        Ok(evicted)
    }

    /// Removes a certification's cache and metadata together.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on repository failure.
    pub async fn clear(&self, certification_id: CertificationId) -> Result<(), CacheError> {
        self.questions.clear_certification(certification_id).await?;
        Ok(())
    }

    /// Logout path: purges every cached question (correct answers included)
    /// and all metadata.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on repository failure.
    pub async fn clear_all(&self) -> Result<(), CacheError> {
        self.questions.clear_all().await?;
        info!("question cache purged");
        Ok(())
    }

    /// Cached rows for specific question ids, in the order given; missing
    /// ids are skipped. Used by resume and local grading, which read the
    /// rows that physically exist rather than going through the TTL check:
    /// a session that started against a cache keeps using it.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on repository failure.
    pub async fn questions_by_ids(
        &self,
        ids: &[QuestionId],
    ) -> Result<Vec<CachedQuestion>, CacheError> {
        Ok(self.questions.get_questions(ids).await?)
    }
}

fn cached_from_remote(
    remote: RemoteQuestion,
    now: DateTime<Utc>,
) -> Result<CachedQuestion, CacheError> {
    let difficulty = Difficulty::from_str(&remote.difficulty)?;
    Ok(CachedQuestion::new(
        remote.id,
        remote.certification_id,
        remote.domain_id,
        remote.topic_id,
        difficulty,
        remote.prompt,
        remote.options,
        remote.correct_answers,
        remote.explanation,
        now,
    )?)
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use exam_core::time::fixed_now;
    use std::sync::Mutex;
    use storage::repository::InMemoryRepository;

    use crate::api::{
        AnswerUpload, ApiError, CreateSessionRequest, ReviewUpload, SessionCompletion,
        SessionCreated,
    };

    /// Serves a fixed question list, or a scripted error.
    struct FakeApi {
        questions: Mutex<Result<Vec<RemoteQuestion>, ApiError>>,
    }

    impl FakeApi {
        fn serving(count: u64) -> Self {
            let questions = (1..=count)
                .map(|id| RemoteQuestion {
                    id: QuestionId::new(id),
                    certification_id: CertificationId::new(1),
                    domain_id: exam_core::model::DomainId::new(1),
                    topic_id: exam_core::model::TopicId::new(1),
                    difficulty: "medium".into(),
                    prompt: format!("Q{id}"),
                    options: vec!["a".into(), "b".into()],
                    correct_answers: vec![0],
                    explanation: None,
                })
                .collect();
            Self {
                questions: Mutex::new(Ok(questions)),
            }
        }

        fn failing() -> Self {
            Self {
                questions: Mutex::new(Err(ApiError::Network("connection refused".into()))),
            }
        }
    }

    #[async_trait]
    impl ExamApi for FakeApi {
        async fn fetch_questions(
            &self,
            _certification_id: CertificationId,
            limit: u32,
        ) -> Result<Vec<RemoteQuestion>, ApiError> {
            match &*self.questions.lock().unwrap() {
                Ok(questions) => Ok(questions
                    .iter()
                    .take(limit as usize)
                    .cloned()
                    .collect()),
                Err(ApiError::Status(status)) => Err(ApiError::Status(*status)),
                Err(ApiError::Network(message)) => Err(ApiError::Network(message.clone())),
            }
        }

        async fn create_session(
            &self,
            _request: &CreateSessionRequest,
        ) -> Result<SessionCreated, ApiError> {
            unimplemented!("not used by cache tests")
        }

        async fn submit_answer(
            &self,
            _session_id: &str,
            _answer: &AnswerUpload,
        ) -> Result<(), ApiError> {
            unimplemented!("not used by cache tests")
        }

        async fn submit_review(&self, _review: &ReviewUpload) -> Result<(), ApiError> {
            unimplemented!("not used by cache tests")
        }

        async fn complete_session(
            &self,
            _session_id: &str,
            _completion: &SessionCompletion,
        ) -> Result<(), ApiError> {
            unimplemented!("not used by cache tests")
        }
    }

    fn service_at(repo: &InMemoryRepository, api: Arc<dyn ExamApi>, at: DateTime<Utc>) -> CacheService {
        CacheService::new(Clock::fixed(at), api, Arc::new(repo.clone()))
    }

    #[tokio::test]
    async fn refresh_writes_cache_and_metadata() {
        let repo = InMemoryRepository::new();
        let service = service_at(&repo, Arc::new(FakeApi::serving(5)), fixed_now());
        let cert = CertificationId::new(1);

        let metadata = service.refresh(cert, 10).await.unwrap();
        assert_eq!(metadata.question_count(), 5);
        assert_eq!(
            metadata.expires_at() - metadata.cached_at(),
            Duration::days(7)
        );

        let cached = service.read(cert, &QuestionFilter::any()).await.unwrap();
        assert_eq!(cached.len(), 5);
        assert!(service.offline_ready(cert).await.unwrap());
    }

    #[tokio::test]
    async fn failed_fetch_preserves_existing_cache() {
        let repo = InMemoryRepository::new();
        let cert = CertificationId::new(1);

        let good = service_at(&repo, Arc::new(FakeApi::serving(3)), fixed_now());
        good.refresh(cert, 10).await.unwrap();

        let bad = service_at(&repo, Arc::new(FakeApi::failing()), fixed_now());
        let err = bad.refresh(cert, 10).await.unwrap_err();
        assert!(matches!(err, CacheError::Fetch(_)));

        // prior cache and metadata fully intact
        let cached = bad.read(cert, &QuestionFilter::any()).await.unwrap();
        assert_eq!(cached.len(), 3);
        assert_eq!(bad.status(cert).await.unwrap(), CacheStatus::Ready);
    }

    #[tokio::test]
    async fn expiry_is_lazy_and_boundary_exact() {
        let repo = InMemoryRepository::new();
        let cert = CertificationId::new(1);
        let cached_at = fixed_now();

        let writer = service_at(&repo, Arc::new(FakeApi::serving(4)), cached_at);
        writer.refresh(cert, 10).await.unwrap();

        // 6d23h later: still served
        let almost = cached_at + Duration::days(6) + Duration::hours(23);
        let reader = service_at(&repo, Arc::new(FakeApi::failing()), almost);
        assert_eq!(reader.read(cert, &QuestionFilter::any()).await.unwrap().len(), 4);

        // just past 7d: reads empty, rows still physically present
        let past = cached_at + Duration::days(7) + Duration::seconds(1);
        let reader = service_at(&repo, Arc::new(FakeApi::failing()), past);
        assert!(reader.read(cert, &QuestionFilter::any()).await.unwrap().is_empty());
        assert_eq!(reader.status(cert).await.unwrap(), CacheStatus::Stale);
        assert!(!reader.offline_ready(cert).await.unwrap());
        assert_eq!(
            reader
                .questions_by_ids(&[QuestionId::new(1)])
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn clear_removes_cache_and_metadata_together() {
        let repo = InMemoryRepository::new();
        let cert = CertificationId::new(1);
        let service = service_at(&repo, Arc::new(FakeApi::serving(2)), fixed_now());

        service.refresh(cert, 10).await.unwrap();
        service.clear(cert).await.unwrap();

        assert_eq!(service.status(cert).await.unwrap(), CacheStatus::Empty);
        assert!(service.read(cert, &QuestionFilter::any()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_download_is_an_error_and_keeps_cache() {
        let repo = InMemoryRepository::new();
        let cert = CertificationId::new(1);

        let good = service_at(&repo, Arc::new(FakeApi::serving(2)), fixed_now());
        good.refresh(cert, 10).await.unwrap();

        let empty = service_at(&repo, Arc::new(FakeApi::serving(0)), fixed_now());
        let err = empty.refresh(cert, 10).await.unwrap_err();
        assert!(matches!(err, CacheError::EmptyDownload(_)));
        assert_eq!(good.read(cert, &QuestionFilter::any()).await.unwrap().len(), 2);
    }
}
