use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

use crate::model::ids::{CertificationId, ExamId, QuestionId};
use crate::model::question::CachedQuestion;

/// Default fixed exam length: 90 minutes.
pub const DEFAULT_EXAM_DURATION_SECS: u32 = 5_400;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

/// Invalid state transitions fail closed: callers treat these as no-ops
/// rather than surfacing them as crashes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExamError {
    #[error("exam has no questions")]
    NoQuestions,

    #[error("exam is not in progress (status: {0})")]
    NotInProgress(ExamStatus),

    #[error("question index {index} out of bounds for {len} questions")]
    IndexOutOfBounds { index: u32, len: u32 },

    #[error("question {0} is not part of this exam")]
    UnknownQuestion(QuestionId),

    #[error("persisted response references question {0} outside the exam")]
    OrphanResponse(QuestionId),
}

//
// ─── STATUS & KIND ─────────────────────────────────────────────────────────────
//

/// Lifecycle of an offline session: none → in progress → completed | abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExamStatus {
    InProgress,
    Completed,
    Abandoned,
}

impl ExamStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ExamStatus::InProgress => "in_progress",
            ExamStatus::Completed => "completed",
            ExamStatus::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExamStatus::InProgress)
    }
}

impl fmt::Display for ExamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exam sessions sync as one batched submission; practice sessions sync each
/// answer individually as it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Exam,
    Practice,
}

impl SessionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Exam => "exam",
            SessionKind::Practice => "practice",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ─── SCORE ─────────────────────────────────────────────────────────────────────
//

/// Provisional local grading result. The server re-grades on sync; this value
/// is never reconciled afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExamScore {
    pub total: u32,
    pub answered: u32,
    pub correct: u32,
}

impl ExamScore {
    /// Correct answers as a percentage of all questions (unanswered count
    /// against the score).
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        f64::from(self.correct) * 100.0 / f64::from(self.total)
    }
}

//
// ─── OFFLINE EXAM ──────────────────────────────────────────────────────────────
//

/// Durable state of an in-flight offline session.
///
/// Every mutation stamps `last_updated_at`; the caller persists the whole
/// value immediately after, so a reload or crash resumes from the last
/// answered question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineExam {
    id: ExamId,
    certification_id: CertificationId,
    kind: SessionKind,
    question_ids: Vec<QuestionId>,
    current_index: u32,
    responses: BTreeMap<QuestionId, Vec<u32>>,
    time_spent_seconds: u32,
    started_at: DateTime<Utc>,
    last_updated_at: DateTime<Utc>,
    status: ExamStatus,
}

impl OfflineExam {
    /// Starts a new in-progress session over the given question order.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::NoQuestions` if the question list is empty.
    pub fn start(
        id: ExamId,
        certification_id: CertificationId,
        kind: SessionKind,
        question_ids: Vec<QuestionId>,
        now: DateTime<Utc>,
    ) -> Result<Self, ExamError> {
        if question_ids.is_empty() {
            return Err(ExamError::NoQuestions);
        }
        Ok(Self {
            id,
            certification_id,
            kind,
            question_ids,
            current_index: 0,
            responses: BTreeMap::new(),
            time_spent_seconds: 0,
            started_at: now,
            last_updated_at: now,
            status: ExamStatus::InProgress,
        })
    }

    /// Rehydrates a session from storage, checking its internal invariants.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::NoQuestions` for an empty question list,
    /// `ExamError::IndexOutOfBounds` for a cursor past the end, and
    /// `ExamError::OrphanResponse` for a response keyed outside the list.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: ExamId,
        certification_id: CertificationId,
        kind: SessionKind,
        question_ids: Vec<QuestionId>,
        current_index: u32,
        responses: Vec<(QuestionId, Vec<u32>)>,
        time_spent_seconds: u32,
        started_at: DateTime<Utc>,
        last_updated_at: DateTime<Utc>,
        status: ExamStatus,
    ) -> Result<Self, ExamError> {
        if question_ids.is_empty() {
            return Err(ExamError::NoQuestions);
        }
        let len = question_ids.len() as u32;
        if current_index >= len {
            return Err(ExamError::IndexOutOfBounds {
                index: current_index,
                len,
            });
        }
        let known: HashSet<QuestionId> = question_ids.iter().copied().collect();
        let mut map = BTreeMap::new();
        for (question_id, selected) in responses {
            if !known.contains(&question_id) {
                return Err(ExamError::OrphanResponse(question_id));
            }
            map.insert(question_id, selected);
        }
        Ok(Self {
            id,
            certification_id,
            kind,
            question_ids,
            current_index,
            responses: map,
            time_spent_seconds,
            started_at,
            last_updated_at,
            status,
        })
    }

    #[must_use]
    pub fn id(&self) -> ExamId {
        self.id
    }

    #[must_use]
    pub fn certification_id(&self) -> CertificationId {
        self.certification_id
    }

    #[must_use]
    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    #[must_use]
    pub fn question_ids(&self) -> &[QuestionId] {
        &self.question_ids
    }

    #[must_use]
    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    #[must_use]
    pub fn current_question_id(&self) -> Option<QuestionId> {
        self.question_ids.get(self.current_index as usize).copied()
    }

    /// Responses as explicit (question, selections) pairs in question order,
    /// the shape both storage and the submission payload want.
    #[must_use]
    pub fn responses(&self) -> Vec<(QuestionId, Vec<u32>)> {
        self.question_ids
            .iter()
            .filter_map(|id| self.responses.get(id).map(|sel| (*id, sel.clone())))
            .collect()
    }

    #[must_use]
    pub fn selected_answers(&self, question_id: QuestionId) -> Option<&[u32]> {
        self.responses.get(&question_id).map(Vec::as_slice)
    }

    #[must_use]
    pub fn answered_count(&self) -> u32 {
        self.responses.len() as u32
    }

    #[must_use]
    pub fn question_count(&self) -> u32 {
        self.question_ids.len() as u32
    }

    #[must_use]
    pub fn time_spent_seconds(&self) -> u32 {
        self.time_spent_seconds
    }

    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn last_updated_at(&self) -> DateTime<Utc> {
        self.last_updated_at
    }

    #[must_use]
    pub fn status(&self) -> ExamStatus {
        self.status
    }

    fn ensure_in_progress(&self) -> Result<(), ExamError> {
        if self.status != ExamStatus::InProgress {
            return Err(ExamError::NotInProgress(self.status));
        }
        Ok(())
    }

    /// Records a selection for a question, overwriting any prior selection.
    /// An empty selection clears the stored response.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::NotInProgress` after a terminal transition and
    /// `ExamError::UnknownQuestion` for a question outside this exam.
    pub fn answer(
        &mut self,
        question_id: QuestionId,
        selected: Vec<u32>,
        now: DateTime<Utc>,
    ) -> Result<(), ExamError> {
        self.ensure_in_progress()?;
        if !self.question_ids.contains(&question_id) {
            return Err(ExamError::UnknownQuestion(question_id));
        }
        if selected.is_empty() {
            self.responses.remove(&question_id);
        } else {
            self.responses.insert(question_id, selected);
        }
        self.last_updated_at = now;
        Ok(())
    }

    /// Moves the cursor so a resumed session reopens at the same question.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::IndexOutOfBounds` for an index past the question
    /// list, or `ExamError::NotInProgress` after a terminal transition.
    pub fn navigate(&mut self, index: u32, now: DateTime<Utc>) -> Result<(), ExamError> {
        self.ensure_in_progress()?;
        let len = self.question_count();
        if index >= len {
            return Err(ExamError::IndexOutOfBounds { index, len });
        }
        self.current_index = index;
        self.last_updated_at = now;
        Ok(())
    }

    /// Adds to the cumulative time spent.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::NotInProgress` after a terminal transition.
    pub fn record_time(&mut self, seconds: u32, now: DateTime<Utc>) -> Result<(), ExamError> {
        self.ensure_in_progress()?;
        self.time_spent_seconds = self.time_spent_seconds.saturating_add(seconds);
        self.last_updated_at = now;
        Ok(())
    }

    /// Terminal transition taken when the session is queued for sync.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::NotInProgress` if the exam already completed or
    /// was abandoned.
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), ExamError> {
        self.ensure_in_progress()?;
        self.status = ExamStatus::Completed;
        self.last_updated_at = now;
        Ok(())
    }

    /// Terminal transition for an explicit discard.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::NotInProgress` if the exam is already terminal.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> Result<(), ExamError> {
        self.ensure_in_progress()?;
        self.status = ExamStatus::Abandoned;
        self.last_updated_at = now;
        Ok(())
    }

    /// Drops question ids no longer present in the cache, along with their
    /// responses, clamping the cursor. Returns how many questions survive.
    /// Used on resume, where missing questions are filtered rather than
    /// failing the whole session.
    pub fn retain_questions(&mut self, available: &HashSet<QuestionId>) -> usize {
        self.question_ids.retain(|id| available.contains(id));
        self.responses.retain(|id, _| available.contains(id));
        let len = self.question_ids.len();
        if len > 0 && self.current_index as usize >= len {
            self.current_index = (len - 1) as u32;
        }
        len
    }

    /// Seconds left on a fixed-duration session, never negative.
    #[must_use]
    pub fn remaining_seconds(&self, duration_secs: u32, now: DateTime<Utc>) -> u32 {
        let elapsed = (now - self.started_at).num_seconds().max(0);
        u64::from(duration_secs)
            .saturating_sub(u64::try_from(elapsed).unwrap_or(u64::MAX))
            .try_into()
            .unwrap_or(0)
    }

    /// Grades the session against the cached correct answers.
    ///
    /// Questions missing from `questions` count as incorrect; grading never
    /// fails because of cache gaps. The result is provisional: the server
    /// re-grades on sync and the two are never reconciled.
    #[must_use]
    pub fn grade(&self, questions: &[CachedQuestion]) -> ExamScore {
        let by_id: BTreeMap<QuestionId, &CachedQuestion> =
            questions.iter().map(|q| (q.id(), q)).collect();

        let mut correct = 0_u32;
        for (question_id, selected) in &self.responses {
            if let Some(question) = by_id.get(question_id) {
                if question.is_correct_selection(selected) {
                    correct += 1;
                }
            }
        }

        ExamScore {
            total: self.question_count(),
            answered: self.answered_count(),
            correct,
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::question::Difficulty;
    use crate::model::{DomainId, TopicId};
    use crate::time::fixed_now;
    use chrono::Duration;

    fn question_ids(n: u64) -> Vec<QuestionId> {
        (1..=n).map(QuestionId::new).collect()
    }

    fn build_exam(n: u64) -> OfflineExam {
        OfflineExam::start(
            ExamId::generate(),
            CertificationId::new(1),
            SessionKind::Exam,
            question_ids(n),
            fixed_now(),
        )
        .unwrap()
    }

    fn build_question(id: u64, correct: Vec<u32>) -> CachedQuestion {
        CachedQuestion::new(
            QuestionId::new(id),
            CertificationId::new(1),
            DomainId::new(1),
            TopicId::new(1),
            Difficulty::Easy,
            format!("Q{id}"),
            vec!["a".into(), "b".into(), "c".into()],
            correct,
            None,
            fixed_now(),
        )
        .unwrap()
    }

    #[test]
    fn start_requires_questions() {
        let err = OfflineExam::start(
            ExamId::generate(),
            CertificationId::new(1),
            SessionKind::Exam,
            Vec::new(),
            fixed_now(),
        )
        .unwrap_err();
        assert!(matches!(err, ExamError::NoQuestions));
    }

    #[test]
    fn answer_overwrites_and_clears() {
        let mut exam = build_exam(3);
        let qid = QuestionId::new(2);

        exam.answer(qid, vec![0], fixed_now()).unwrap();
        exam.answer(qid, vec![1, 2], fixed_now()).unwrap();
        assert_eq!(exam.selected_answers(qid), Some(&[1, 2][..]));
        assert_eq!(exam.answered_count(), 1);

        exam.answer(qid, Vec::new(), fixed_now()).unwrap();
        assert_eq!(exam.selected_answers(qid), None);
        assert_eq!(exam.answered_count(), 0);
    }

    #[test]
    fn answer_rejects_foreign_question() {
        let mut exam = build_exam(3);
        let err = exam
            .answer(QuestionId::new(99), vec![0], fixed_now())
            .unwrap_err();
        assert!(matches!(err, ExamError::UnknownQuestion(_)));
    }

    #[test]
    fn navigate_is_bounds_checked() {
        let mut exam = build_exam(3);
        exam.navigate(2, fixed_now()).unwrap();
        assert_eq!(exam.current_index(), 2);

        let err = exam.navigate(3, fixed_now()).unwrap_err();
        assert!(matches!(err, ExamError::IndexOutOfBounds { index: 3, len: 3 }));
    }

    #[test]
    fn terminal_states_fail_closed() {
        let mut exam = build_exam(2);
        exam.complete(fixed_now()).unwrap();

        assert!(matches!(
            exam.answer(QuestionId::new(1), vec![0], fixed_now()),
            Err(ExamError::NotInProgress(ExamStatus::Completed))
        ));
        assert!(matches!(
            exam.abandon(fixed_now()),
            Err(ExamError::NotInProgress(ExamStatus::Completed))
        ));
        assert!(matches!(
            exam.complete(fixed_now()),
            Err(ExamError::NotInProgress(ExamStatus::Completed))
        ));
    }

    #[test]
    fn retain_questions_filters_and_clamps() {
        let mut exam = build_exam(5);
        exam.answer(QuestionId::new(4), vec![0], fixed_now()).unwrap();
        exam.answer(QuestionId::new(2), vec![1], fixed_now()).unwrap();
        exam.navigate(4, fixed_now()).unwrap();

        let available: HashSet<QuestionId> =
            [1, 2, 3].into_iter().map(QuestionId::new).collect();
        let survivors = exam.retain_questions(&available);

        assert_eq!(survivors, 3);
        assert_eq!(exam.question_count(), 3);
        assert_eq!(exam.current_index(), 2);
        assert_eq!(exam.selected_answers(QuestionId::new(2)), Some(&[1][..]));
        assert_eq!(exam.selected_answers(QuestionId::new(4)), None);
    }

    #[test]
    fn remaining_time_never_goes_negative() {
        let exam = build_exam(1);
        let now = fixed_now();

        assert_eq!(exam.remaining_seconds(100, now + Duration::seconds(40)), 60);
        assert_eq!(exam.remaining_seconds(100, now + Duration::seconds(100)), 0);
        assert_eq!(exam.remaining_seconds(100, now + Duration::hours(2)), 0);
    }

    #[test]
    fn grading_counts_exact_matches_only() {
        let mut exam = build_exam(4);
        exam.answer(QuestionId::new(1), vec![0], fixed_now()).unwrap();
        exam.answer(QuestionId::new(2), vec![1, 2], fixed_now()).unwrap();
        exam.answer(QuestionId::new(3), vec![2], fixed_now()).unwrap();

        let questions = vec![
            build_question(1, vec![0]),
            build_question(2, vec![2, 1]),
            build_question(3, vec![0]),
            build_question(4, vec![0]),
        ];
        let score = exam.grade(&questions);

        assert_eq!(score.total, 4);
        assert_eq!(score.answered, 3);
        assert_eq!(score.correct, 2);
        assert!((score.percent() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn grading_tolerates_missing_question_data() {
        let mut exam = build_exam(2);
        exam.answer(QuestionId::new(1), vec![0], fixed_now()).unwrap();
        exam.answer(QuestionId::new(2), vec![0], fixed_now()).unwrap();

        // only question 1 still cached
        let score = exam.grade(&[build_question(1, vec![0])]);
        assert_eq!(score.correct, 1);
        assert_eq!(score.answered, 2);
    }

    #[test]
    fn persisted_roundtrip_checks_invariants() {
        let exam = build_exam(3);
        let rebuilt = OfflineExam::from_persisted(
            exam.id(),
            exam.certification_id(),
            exam.kind(),
            exam.question_ids().to_vec(),
            exam.current_index(),
            exam.responses(),
            exam.time_spent_seconds(),
            exam.started_at(),
            exam.last_updated_at(),
            exam.status(),
        )
        .unwrap();
        assert_eq!(rebuilt, exam);

        let err = OfflineExam::from_persisted(
            exam.id(),
            exam.certification_id(),
            exam.kind(),
            exam.question_ids().to_vec(),
            0,
            vec![(QuestionId::new(42), vec![0])],
            0,
            exam.started_at(),
            exam.last_updated_at(),
            ExamStatus::InProgress,
        )
        .unwrap_err();
        assert!(matches!(err, ExamError::OrphanResponse(_)));
    }
}
