use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::model::ids::{CertificationId, DomainId, QuestionId, TopicId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QuestionError {
    #[error("question prompt cannot be empty")]
    EmptyPrompt,

    #[error("question needs at least two options, got {0}")]
    NotEnoughOptions(usize),

    #[error("question has no correct answer")]
    NoCorrectAnswer,

    #[error("correct answer index {index} out of bounds for {len} options")]
    CorrectAnswerOutOfBounds { index: u32, len: usize },

    #[error("unknown difficulty: {0}")]
    UnknownDifficulty(String),
}

//
// ─── DIFFICULTY ────────────────────────────────────────────────────────────────
//

/// Three-level difficulty band assigned by the question author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Difficulty {
    type Err = QuestionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(QuestionError::UnknownDifficulty(other.to_string())),
        }
    }
}

//
// ─── CACHED QUESTION ───────────────────────────────────────────────────────────
//

/// Immutable snapshot of a downloaded question.
///
/// Created when a certification's question set is cached, replaced wholesale
/// on re-download, deleted on expiry/clear/logout. Carries the correct
/// answers so offline sessions can be graded without the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedQuestion {
    id: QuestionId,
    certification_id: CertificationId,
    domain_id: DomainId,
    topic_id: TopicId,
    difficulty: Difficulty,
    prompt: String,
    options: Vec<String>,
    correct_answers: Vec<u32>,
    explanation: Option<String>,
    cached_at: DateTime<Utc>,
}

impl CachedQuestion {
    /// Builds a validated snapshot.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError` if the prompt is blank, there are fewer than
    /// two options, no correct answer is marked, or a correct answer index
    /// falls outside the option list.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: QuestionId,
        certification_id: CertificationId,
        domain_id: DomainId,
        topic_id: TopicId,
        difficulty: Difficulty,
        prompt: impl Into<String>,
        options: Vec<String>,
        correct_answers: Vec<u32>,
        explanation: Option<String>,
        cached_at: DateTime<Utc>,
    ) -> Result<Self, QuestionError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(QuestionError::EmptyPrompt);
        }
        if options.len() < 2 {
            return Err(QuestionError::NotEnoughOptions(options.len()));
        }
        if correct_answers.is_empty() {
            return Err(QuestionError::NoCorrectAnswer);
        }
        for &index in &correct_answers {
            if index as usize >= options.len() {
                return Err(QuestionError::CorrectAnswerOutOfBounds {
                    index,
                    len: options.len(),
                });
            }
        }

        Ok(Self {
            id,
            certification_id,
            domain_id,
            topic_id,
            difficulty,
            prompt,
            options,
            correct_answers,
            explanation,
            cached_at,
        })
    }

    /// Rehydrates a snapshot from storage, re-running the same validation.
    ///
    /// # Errors
    ///
    /// Returns `QuestionError` for the same conditions as [`CachedQuestion::new`].
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        id: QuestionId,
        certification_id: CertificationId,
        domain_id: DomainId,
        topic_id: TopicId,
        difficulty: Difficulty,
        prompt: String,
        options: Vec<String>,
        correct_answers: Vec<u32>,
        explanation: Option<String>,
        cached_at: DateTime<Utc>,
    ) -> Result<Self, QuestionError> {
        Self::new(
            id,
            certification_id,
            domain_id,
            topic_id,
            difficulty,
            prompt,
            options,
            correct_answers,
            explanation,
            cached_at,
        )
    }

    #[must_use]
    pub fn id(&self) -> QuestionId {
        self.id
    }

    #[must_use]
    pub fn certification_id(&self) -> CertificationId {
        self.certification_id
    }

    #[must_use]
    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    #[must_use]
    pub fn topic_id(&self) -> TopicId {
        self.topic_id
    }

    #[must_use]
    pub fn difficulty(&self) -> Difficulty {
        self.difficulty
    }

    #[must_use]
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    #[must_use]
    pub fn options(&self) -> &[String] {
        &self.options
    }

    #[must_use]
    pub fn correct_answers(&self) -> &[u32] {
        &self.correct_answers
    }

    #[must_use]
    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    #[must_use]
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Whether a selection is correct: the selected set must equal the
    /// correct set exactly, independent of order.
    #[must_use]
    pub fn is_correct_selection(&self, selected: &[u32]) -> bool {
        if selected.is_empty() {
            return false;
        }
        let selected: BTreeSet<u32> = selected.iter().copied().collect();
        let correct: BTreeSet<u32> = self.correct_answers.iter().copied().collect();
        selected == correct
    }
}

//
// ─── FILTER ────────────────────────────────────────────────────────────────────
//

/// Optional narrowing of a cache read by domain, topic, or difficulty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuestionFilter {
    pub domain_id: Option<DomainId>,
    pub topic_id: Option<TopicId>,
    pub difficulty: Option<Difficulty>,
}

impl QuestionFilter {
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_domain(mut self, domain_id: DomainId) -> Self {
        self.domain_id = Some(domain_id);
        self
    }

    #[must_use]
    pub fn with_topic(mut self, topic_id: TopicId) -> Self {
        self.topic_id = Some(topic_id);
        self
    }

    #[must_use]
    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    #[must_use]
    pub fn matches(&self, question: &CachedQuestion) -> bool {
        if let Some(domain) = self.domain_id {
            if question.domain_id() != domain {
                return false;
            }
        }
        if let Some(topic) = self.topic_id {
            if question.topic_id() != topic {
                return false;
            }
        }
        if let Some(difficulty) = self.difficulty {
            if question.difficulty() != difficulty {
                return false;
            }
        }
        true
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn build_question(id: u64) -> CachedQuestion {
        CachedQuestion::new(
            QuestionId::new(id),
            CertificationId::new(1),
            DomainId::new(10),
            TopicId::new(100),
            Difficulty::Medium,
            "Which layer handles retransmission?",
            vec!["Physical".into(), "Transport".into(), "Session".into()],
            vec![1],
            Some("TCP lives at the transport layer.".into()),
            fixed_now(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_blank_prompt() {
        let err = CachedQuestion::new(
            QuestionId::new(1),
            CertificationId::new(1),
            DomainId::new(1),
            TopicId::new(1),
            Difficulty::Easy,
            "   ",
            vec!["a".into(), "b".into()],
            vec![0],
            None,
            fixed_now(),
        )
        .unwrap_err();
        assert!(matches!(err, QuestionError::EmptyPrompt));
    }

    #[test]
    fn rejects_out_of_bounds_correct_answer() {
        let err = CachedQuestion::new(
            QuestionId::new(1),
            CertificationId::new(1),
            DomainId::new(1),
            TopicId::new(1),
            Difficulty::Easy,
            "Q",
            vec!["a".into(), "b".into()],
            vec![2],
            None,
            fixed_now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            QuestionError::CorrectAnswerOutOfBounds { index: 2, len: 2 }
        ));
    }

    #[test]
    fn selection_correctness_is_set_equality() {
        let question = CachedQuestion::new(
            QuestionId::new(1),
            CertificationId::new(1),
            DomainId::new(1),
            TopicId::new(1),
            Difficulty::Hard,
            "Pick two",
            vec!["a".into(), "b".into(), "c".into()],
            vec![0, 2],
            None,
            fixed_now(),
        )
        .unwrap();

        assert!(question.is_correct_selection(&[2, 0]));
        assert!(!question.is_correct_selection(&[0]));
        assert!(!question.is_correct_selection(&[0, 1, 2]));
        assert!(!question.is_correct_selection(&[]));
    }

    #[test]
    fn filter_narrows_by_each_axis() {
        let question = build_question(1);

        assert!(QuestionFilter::any().matches(&question));
        assert!(
            QuestionFilter::any()
                .with_domain(DomainId::new(10))
                .with_difficulty(Difficulty::Medium)
                .matches(&question)
        );
        assert!(
            !QuestionFilter::any()
                .with_topic(TopicId::new(999))
                .matches(&question)
        );
    }

    #[test]
    fn difficulty_roundtrip() {
        for d in [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard] {
            assert_eq!(d.as_str().parse::<Difficulty>().unwrap(), d);
        }
        assert!(matches!(
            "brutal".parse::<Difficulty>().unwrap_err(),
            QuestionError::UnknownDifficulty(_)
        ));
    }
}
