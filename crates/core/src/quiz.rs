//! # Quiz Engine
//!
//! A quiz is an ordered, fixed set of questions of one kind. The engine
//! tracks the current question, the running score and one result per
//! answered question. A session owns at most one engine through a
//! [`QuizSlot`], which is where the "one active quiz" rule is enforced.
//!
//! Answering is split in two steps. [`QuizSlot::submit_answer`] records the
//! raw answer and returns what an evaluator needs; [`QuizSlot::record_result`]
//! applies the verdict and advances. The split lets a semantic verdict come
//! back from the conversational model on a later tool call.

use crate::evaluator::AnswerPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of quiz the engine can run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum QuizKind {
    LabelReading,
    PhotoIdentification,
    Knowledge,
    Scenario,
}

impl QuizKind {
    pub const ALL: [QuizKind; 4] = [
        QuizKind::LabelReading,
        QuizKind::PhotoIdentification,
        QuizKind::Knowledge,
        QuizKind::Scenario,
    ];

    /// The skill name recorded in the assessment history.
    pub fn skill_name(self) -> &'static str {
        match self {
            QuizKind::LabelReading => "Label Reading",
            QuizKind::PhotoIdentification => "Photo Identification",
            QuizKind::Knowledge => "Technical Knowledge",
            QuizKind::Scenario => "Scenario Judgement",
        }
    }

    /// Stable identifier used for progress tracking.
    pub fn module_id(self) -> &'static str {
        match self {
            QuizKind::LabelReading => "label_reading",
            QuizKind::PhotoIdentification => "photo_identification",
            QuizKind::Knowledge => "knowledge",
            QuizKind::Scenario => "scenario",
        }
    }

    pub fn from_skill_name(skill: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.skill_name().eq_ignore_ascii_case(skill.trim()))
    }
}

impl fmt::Display for QuizKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.skill_name())
    }
}

/// A single question in a quiz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub prompt: String,
    pub expected_answer: String,
    /// Other answers that also count as correct, e.g. the text of the
    /// correct option in a multiple-choice question.
    #[serde(default)]
    pub accepted_answers: Vec<String>,
    #[serde(default)]
    pub media_refs: Vec<String>,
    pub policy: AnswerPolicy,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// The outcome of one answered question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub question: String,
    pub candidate_answer: String,
    pub expected_answer: String,
    pub is_correct: bool,
    #[serde(default)]
    pub media_refs: Vec<String>,
}

/// What the candidate is looking at right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionView {
    pub number: usize,
    pub total: usize,
    pub prompt: String,
    pub media_refs: Vec<String>,
}

impl QuestionView {
    /// Renders the canonical question line, e.g.
    /// `Looking at [Image: a.jpg] - Question 2/3: What is the brand?`.
    pub fn render(&self) -> String {
        let question = format!("Question {}/{}: {}", self.number, self.total, self.prompt);
        if self.media_refs.is_empty() {
            return question;
        }
        let images = self
            .media_refs
            .iter()
            .map(|media| format!("[Image: {media}]"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("Looking at {images} - {question}")
    }
}

/// Everything needed to judge a submitted answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRequest {
    pub number: usize,
    pub total: usize,
    pub prompt: String,
    pub raw_answer: String,
    pub expected_answer: String,
    pub accepted_answers: Vec<String>,
    pub policy: AnswerPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub kind: QuizKind,
    pub score: u32,
    pub total: usize,
    /// Percentage of correct answers, rounded to two decimals.
    pub accuracy: f64,
    pub results: Vec<AnswerResult>,
}

/// Where a quiz stands after a result is recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Next(QuestionView),
    Completed(CompletionSummary),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuizError {
    #[error("a {0} quiz is already active")]
    AlreadyActive(QuizKind),
    #[error("no quiz is active")]
    NoActiveQuiz,
    #[error("cannot start a quiz without questions")]
    EmptyQuestionSet,
    #[error("no answer has been submitted for the current question")]
    NoPendingAnswer,
}

/// Runs one quiz from first question to summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizEngine {
    kind: QuizKind,
    questions: Vec<Question>,
    current_index: usize,
    score: u32,
    active: bool,
    results: Vec<AnswerResult>,
    pending_answer: Option<String>,
}

impl QuizEngine {
    pub fn kind(&self) -> QuizKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn score(&self) -> u32 {
        self.score
    }

    pub fn total(&self) -> usize {
        self.questions.len()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn results(&self) -> &[AnswerResult] {
        &self.results
    }

    pub fn pending_answer(&self) -> Option<&str> {
        self.pending_answer.as_deref()
    }

    pub fn current_question(&self) -> Option<&Question> {
        if self.active {
            self.questions.get(self.current_index)
        } else {
            None
        }
    }

    pub fn current_view(&self) -> Option<QuestionView> {
        self.current_question().map(|question| QuestionView {
            number: self.current_index + 1,
            total: self.questions.len(),
            prompt: question.prompt.clone(),
            media_refs: question.media_refs.clone(),
        })
    }

    /// Percentage correct over all questions, rounded to two decimals.
    pub fn accuracy(&self) -> f64 {
        if self.questions.is_empty() {
            return 0.0;
        }
        let raw = f64::from(self.score) / self.questions.len() as f64 * 100.0;
        (raw * 100.0).round() / 100.0
    }

    fn summary(&self) -> CompletionSummary {
        CompletionSummary {
            kind: self.kind,
            score: self.score,
            total: self.questions.len(),
            accuracy: self.accuracy(),
            results: self.results.clone(),
        }
    }
}

/// Holds the session's quiz, if any. At most one quiz is active at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuizSlot {
    engine: Option<QuizEngine>,
}

impl QuizSlot {
    pub fn engine(&self) -> Option<&QuizEngine> {
        self.engine.as_ref()
    }

    /// The running quiz, if there is one.
    pub fn active(&self) -> Option<&QuizEngine> {
        self.engine.as_ref().filter(|engine| engine.active)
    }

    pub fn is_active(&self) -> bool {
        self.active().is_some()
    }

    /// Starts a new quiz over `questions`.
    ///
    /// Refused with [`QuizError::AlreadyActive`] while another quiz is
    /// running; the running quiz is not touched.
    pub fn start(
        &mut self,
        kind: QuizKind,
        questions: Vec<Question>,
    ) -> Result<QuestionView, QuizError> {
        if let Some(active) = self.active() {
            return Err(QuizError::AlreadyActive(active.kind));
        }
        if questions.is_empty() {
            return Err(QuizError::EmptyQuestionSet);
        }
        let engine = QuizEngine {
            kind,
            questions,
            current_index: 0,
            score: 0,
            active: true,
            results: Vec::new(),
            pending_answer: None,
        };
        let view = engine.current_view().ok_or(QuizError::EmptyQuestionSet)?;
        self.engine = Some(engine);
        Ok(view)
    }

    /// Records the candidate's raw answer for the current question and
    /// returns what is needed to judge it. Re-submitting replaces the
    /// pending answer.
    pub fn submit_answer(&mut self, answer: &str) -> Result<EvaluationRequest, QuizError> {
        let engine = self
            .engine
            .as_mut()
            .filter(|engine| engine.active)
            .ok_or(QuizError::NoActiveQuiz)?;
        let question = engine
            .questions
            .get(engine.current_index)
            .ok_or(QuizError::NoActiveQuiz)?;
        let request = EvaluationRequest {
            number: engine.current_index + 1,
            total: engine.questions.len(),
            prompt: question.prompt.clone(),
            raw_answer: answer.trim().to_string(),
            expected_answer: question.expected_answer.clone(),
            accepted_answers: question.accepted_answers.clone(),
            policy: question.policy,
        };
        engine.pending_answer = Some(request.raw_answer.clone());
        Ok(request)
    }

    /// Applies the verdict for the pending answer and moves on.
    pub fn record_result(&mut self, is_correct: bool) -> Result<StepOutcome, QuizError> {
        let engine = self
            .engine
            .as_mut()
            .filter(|engine| engine.active)
            .ok_or(QuizError::NoActiveQuiz)?;
        let answer = engine
            .pending_answer
            .take()
            .ok_or(QuizError::NoPendingAnswer)?;
        let question = engine
            .questions
            .get(engine.current_index)
            .ok_or(QuizError::NoActiveQuiz)?;

        engine.results.push(AnswerResult {
            question: question.prompt.clone(),
            candidate_answer: answer,
            expected_answer: question.expected_answer.clone(),
            is_correct,
            media_refs: question.media_refs.clone(),
        });
        if is_correct {
            engine.score += 1;
        }
        engine.current_index += 1;

        if engine.current_index >= engine.questions.len() {
            engine.active = false;
            return Ok(StepOutcome::Completed(engine.summary()));
        }
        engine
            .current_view()
            .map(StepOutcome::Next)
            .ok_or(QuizError::NoActiveQuiz)
    }

    /// Drops the quiz whatever its state.
    pub fn clear(&mut self) {
        self.engine = None;
    }
}
