//! End-to-end offline round trip: cache questions, go offline, take an exam,
//! submit, come back online, flush.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use exam_core::Clock;
use exam_core::model::{CertificationId, DomainId, QuestionId, SessionKind, TopicId};
use exam_core::time::fixed_now;
use services::api::{
    AnswerUpload, ApiError, CreateSessionRequest, ExamApi, RemoteQuestion, ReviewUpload,
    SessionCompletion, SessionCreated,
};
use services::host::ManualHost;
use services::sync::FlushReport;
use services::{AppServices, ExamFlowError};
use storage::repository::Storage;

/// Remote API double: serves a bulk question set and records everything the
/// sync queue uploads.
struct RecordingApi {
    question_count: u64,
    sessions_created: AtomicU32,
    completions: Mutex<Vec<(String, SessionCompletion)>>,
    answers: Mutex<Vec<(String, AnswerUpload)>>,
}

impl RecordingApi {
    fn serving(question_count: u64) -> Self {
        Self {
            question_count,
            sessions_created: AtomicU32::new(0),
            completions: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ExamApi for RecordingApi {
    async fn fetch_questions(
        &self,
        certification_id: CertificationId,
        limit: u32,
    ) -> Result<Vec<RemoteQuestion>, ApiError> {
        Ok((1..=self.question_count.min(u64::from(limit)))
            .map(|id| RemoteQuestion {
                id: QuestionId::new(id),
                certification_id,
                domain_id: DomainId::new(1 + id % 3),
                topic_id: TopicId::new(10 + id % 5),
                difficulty: "medium".into(),
                prompt: format!("Question {id}?"),
                options: vec!["alpha".into(), "beta".into(), "gamma".into()],
                correct_answers: vec![u32::try_from(id % 3).unwrap()],
                explanation: Some("because".into()),
            })
            .collect())
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
        self.answers
            .lock()
            .unwrap()
            .push((session_id.to_string(), answer.clone()));
        Ok(())
    }

    async fn submit_review(&self, _review: &ReviewUpload) -> Result<(), ApiError> {
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: &str,
        completion: &SessionCompletion,
    ) -> Result<(), ApiError> {
        self.completions
            .lock()
            .unwrap()
            .push((session_id.to_string(), completion.clone()));
        Ok(())
    }
}

fn build_app(api: Arc<RecordingApi>, host: Arc<ManualHost>) -> AppServices {
    AppServices::with_storage(
        Storage::in_memory(),
        Clock::fixed(fixed_now()),
        api,
        host,
    )
}

#[tokio::test]
async fn offline_exam_round_trip() {
    let api = Arc::new(RecordingApi::serving(10));
    let host = Arc::new(ManualHost::new(true));
    let app = build_app(Arc::clone(&api), Arc::clone(&host));
    let cert = CertificationId::new(1);

    // online: download the working set
    app.cache().refresh(cert, 10).await.unwrap();
    assert!(app.cache().offline_ready(cert).await.unwrap());

    // offline from here on
    host.set_online(false);

    let started = app
        .exam_flow()
        .start(cert, SessionKind::Exam, 10)
        .await
        .unwrap();
    assert_eq!(started.exam.question_count(), 10);

    for question_id in started.exam.question_ids()[..8].to_vec() {
        app.exam_flow()
            .answer_question(started.exam.id(), question_id, vec![0])
            .await
            .unwrap();
    }

    let submitted = app.exam_flow().submit(started.exam.id()).await.unwrap();
    assert_eq!(submitted.score.answered, 8);

    // exactly one full-exam item; flushing while offline is a no-op
    assert_eq!(app.sync_queue().pending_count().await.unwrap(), 1);
    assert_eq!(
        app.sync_queue().flush().await.unwrap(),
        FlushReport::default()
    );
    assert_eq!(app.sync_queue().pending_count().await.unwrap(), 1);

    // back online: one flush drains the queue
    host.set_online(true);
    let report = app.orchestrator().sync_now().await.unwrap();
    assert_eq!(report, Some(FlushReport { synced: 1, failed: 0 }));
    assert_eq!(app.sync_queue().pending_count().await.unwrap(), 0);

    // the server saw one session and one batched completion
    assert_eq!(api.sessions_created.load(Ordering::SeqCst), 1);
    let completions = api.completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    let (_, completion) = &completions[0];
    assert_eq!(completion.responses.len(), 8);
    assert_eq!(completion.question_count, 10);
    assert_eq!(completion.client_token, started.exam.id().to_string());

    // the confirmed submission released the local exam state
    assert!(matches!(
        app.exam_flow().resume(started.exam.id()).await.unwrap_err(),
        ExamFlowError::NotFound(_)
    ));
}

#[tokio::test]
async fn practice_session_syncs_each_answer_through_one_server_session() {
    let api = Arc::new(RecordingApi::serving(5));
    let host = Arc::new(ManualHost::new(true));
    let app = build_app(Arc::clone(&api), Arc::clone(&host));
    let cert = CertificationId::new(1);

    app.cache().refresh(cert, 5).await.unwrap();
    host.set_online(false);

    let started = app
        .exam_flow()
        .start(cert, SessionKind::Practice, 3)
        .await
        .unwrap();
    for question_id in started.exam.question_ids().to_vec() {
        app.exam_flow()
            .answer_question(started.exam.id(), question_id, vec![1])
            .await
            .unwrap();
    }
    assert_eq!(app.sync_queue().pending_count().await.unwrap(), 3);

    host.set_online(true);
    let report = app.orchestrator().sync_now().await.unwrap();
    assert_eq!(report, Some(FlushReport { synced: 3, failed: 0 }));

    // all three answers rode a single memoized server session
    assert_eq!(api.sessions_created.load(Ordering::SeqCst), 1);
    let answers = api.answers.lock().unwrap();
    assert_eq!(answers.len(), 3);
    assert!(answers.iter().all(|(session, _)| session == "srv-0"));
}

#[tokio::test(start_paused = true)]
async fn regained_connectivity_triggers_a_flush() {
    let api = Arc::new(RecordingApi::serving(3));
    let host = Arc::new(ManualHost::new(true));
    let app = build_app(Arc::clone(&api), Arc::clone(&host));
    let cert = CertificationId::new(1);

    app.cache().refresh(cert, 3).await.unwrap();
    host.set_online(false);

    app.sync_queue()
        .enqueue_review(QuestionId::new(1), 4)
        .await
        .unwrap();

    let orchestrator = app.orchestrator();
    let loop_handle = tokio::spawn(async move { orchestrator.run().await });

    host.set_online(true);

    // settle delay then flush; paused time advances while we sleep
    let mut drained = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if app.sync_queue().pending_count().await.unwrap() == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "connectivity transition should have flushed the queue");

    loop_handle.abort();
}
