//! Remote exam API behind an injectable seam.
//!
//! The sync queue only talks to [`ExamApi`]; tests script the trait while the
//! app wires in [`HttpExamApi`]. Responses are classified into terminal 4xx
//! rejections and retryable network/5xx failures.

use std::env;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use exam_core::model::{CertificationId, DomainId, QuestionId, TopicId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("request failed with status {0}")]
    Status(reqwest::StatusCode),

    #[error("network error: {0}")]
    Network(String),
}

impl ApiError {
    /// A 4xx means the request itself can never succeed by repetition;
    /// everything else (5xx, transport failure) is worth retrying.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApiError::Status(status) if status.is_client_error())
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Network(e.to_string())
    }
}

//
// ─── WIRE TYPES ────────────────────────────────────────────────────────────────
//

/// `POST /sessions` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub certification_id: CertificationId,
    pub session_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<TopicId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<DomainId>,
    pub question_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreated {
    pub session_id: String,
}

/// `POST /sessions/{id}/answer` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerUpload {
    pub question_id: QuestionId,
    pub selected_answers: Vec<u32>,
    pub time_spent_seconds: u32,
}

/// `POST /questions/review` request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewUpload {
    pub question_id: QuestionId,
    pub quality: u8,
}

/// One response inside a batched session completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseUpload {
    pub question_id: QuestionId,
    pub selected_answers: Vec<u32>,
    pub correct: bool,
}

/// `POST /sessions/{id}/complete` request body: the whole offline exam in
/// one batch, with aggregate timing. Correctness flags are the client's
/// provisional grading; the server re-grades authoritatively.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompletion {
    pub client_token: String,
    pub responses: Vec<ResponseUpload>,
    pub question_count: u32,
    pub correct_count: u32,
    pub total_time_seconds: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Question as served by `GET /questions/bulk`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteQuestion {
    pub id: QuestionId,
    pub certification_id: CertificationId,
    pub domain_id: DomainId,
    pub topic_id: TopicId,
    pub difficulty: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_answers: Vec<u32>,
    #[serde(default)]
    pub explanation: Option<String>,
}

//
// ─── API SEAM ──────────────────────────────────────────────────────────────────
//

/// The slice of the remote API the offline engine consumes.
#[async_trait]
pub trait ExamApi: Send + Sync {
    /// Download up to `limit` questions for a certification.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` on transport failure or a non-2xx response.
    async fn fetch_questions(
        &self,
        certification_id: CertificationId,
        limit: u32,
    ) -> Result<Vec<RemoteQuestion>, ApiError>;

    /// Create a server session for an offline-originated one.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` on transport failure or a non-2xx response.
    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<SessionCreated, ApiError>;

    /// Post a single answer into an existing server session.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` on transport failure or a non-2xx response.
    async fn submit_answer(
        &self,
        session_id: &str,
        answer: &AnswerUpload,
    ) -> Result<(), ApiError>;

    /// Post a review quality rating.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` on transport failure or a non-2xx response.
    async fn submit_review(&self, review: &ReviewUpload) -> Result<(), ApiError>;

    /// Complete a server session with the batched offline responses.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` on transport failure or a non-2xx response.
    async fn complete_session(
        &self,
        session_id: &str,
        completion: &SessionCompletion,
    ) -> Result<(), ApiError>;
}

//
// ─── HTTP IMPLEMENTATION ───────────────────────────────────────────────────────
//

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
}

impl ApiConfig {
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("EXAM_API_BASE_URL").ok()?;
        if base_url.trim().is_empty() {
            return None;
        }
        let token = env::var("EXAM_API_TOKEN").ok().filter(|t| !t.is_empty());
        Some(Self { base_url, token })
    }
}

#[derive(Clone)]
pub struct HttpExamApi {
    client: Client,
    config: ApiConfig,
}

impl HttpExamApi {
    #[must_use]
    pub fn new(config: ApiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if !response.status().is_success() {
            return Err(ApiError::Status(response.status()));
        }
        Ok(response)
    }
}

#[async_trait]
impl ExamApi for HttpExamApi {
    async fn fetch_questions(
        &self,
        certification_id: CertificationId,
        limit: u32,
    ) -> Result<Vec<RemoteQuestion>, ApiError> {
        let response = self
            .request(self.client.get(self.url("questions/bulk")))
            .query(&[
                ("certificationId", certification_id.value().to_string()),
                ("limit", limit.to_string()),
            ])
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        Ok(response.json().await?)
    }

    async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<SessionCreated, ApiError> {
        let response = self
            .request(self.client.post(self.url("sessions")))
            .json(request)
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        Ok(response.json().await?)
    }

    async fn submit_answer(
        &self,
        session_id: &str,
        answer: &AnswerUpload,
    ) -> Result<(), ApiError> {
        let response = self
            .request(
                self.client
                    .post(self.url(&format!("sessions/{session_id}/answer"))),
            )
            .json(answer)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn submit_review(&self, review: &ReviewUpload) -> Result<(), ApiError> {
        let response = self
            .request(self.client.post(self.url("questions/review")))
            .json(review)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn complete_session(
        &self,
        session_id: &str,
        completion: &SessionCompletion,
    ) -> Result<(), ApiError> {
        let response = self
            .request(
                self.client
                    .post(self.url(&format!("sessions/{session_id}/complete"))),
            )
            .json(completion)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }
}
