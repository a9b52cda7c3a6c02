//! Assessment Tools
//!
//! This module implements the tools the conversational model uses to drive an
//! assessment: reading the candidate profile, setting the role, running
//! quizzes and computing the verdict. Tools operate on a staged copy of the
//! session; the orchestrator commits that copy only when the whole turn
//! succeeds, so a failed turn leaves no partial tool effects behind.
//!
//! Every tool returns `Result<String, String>`. An `Err` is a descriptive
//! message handed back to the model as the tool result, never a failure of
//! the turn.

use crate::evaluator::{AnswerEvaluator, AnswerKey, AnswerPolicy, Evaluation};
use crate::question_bank::QuestionBank;
use crate::quiz::{CompletionSummary, QuizError, QuizKind, StepOutcome};
use crate::session::{FlowStage, ProgressStatus, Session};
use crate::verdict::{CompetencyTable, calculate_verdict};
use anyhow::Result;
use async_openai::types::{ChatCompletionTool, ChatCompletionToolArgs, FunctionObjectArgs};
use schemars::JsonSchema;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

// --- Side effects applied after commit ---

/// A write to the profile store produced by a tool, applied only after the
/// turn's session state has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileEffect {
    RoleSelected(String),
    Progress {
        skill: String,
        module_id: String,
        status: ProgressStatus,
    },
}

// --- Data Structures for Tools ---

/// Arguments for `update_candidate_role`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct UpdateRoleArgs {
    /// The role the candidate is applying for, e.g. "Electrician".
    #[schemars(description = "The job role the candidate wants to be assessed for")]
    pub role: String,
    /// The candidate's name, if they gave it.
    #[serde(default)]
    pub name: Option<String>,
}

/// Arguments for `start_skill_assessment`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct StartSkillArgs {
    #[schemars(description = "Name of the skill being assessed, e.g. 'Stitching'")]
    pub skill_name: String,
}

/// Arguments for `complete_skill_assessment`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct CompleteSkillArgs {
    #[schemars(description = "Name of the skill whose assessment is finished")]
    pub skill_name: String,
    #[schemars(description = "Numeric score for the skill")]
    pub score: f64,
    #[schemars(description = "Grade such as 'Excellent', 'Good', 'Fair' or 'Poor'")]
    pub grade: String,
    /// Free-form observations recorded with the result.
    #[serde(default)]
    pub details: Option<Value>,
}

/// Arguments for `start_quiz`.
#[derive(Deserialize, JsonSchema, Debug, Default)]
pub struct StartQuizArgs {
    #[schemars(
        description = "Quiz to start. Omit to start the next quiz in the candidate's assessment plan."
    )]
    #[serde(default)]
    pub kind: Option<QuizKind>,
}

/// Arguments for `answer_quiz_question`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct AnswerArgs {
    #[schemars(description = "The candidate's answer, exactly as they gave it")]
    pub answer: String,
}

/// Arguments for `record_quiz_result`.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct RecordResultArgs {
    #[schemars(
        description = "Your judgement of the submitted answer: true if it means the same as the expected answer"
    )]
    pub is_correct: bool,
}

/// Descriptions for every tool, in the order they are offered.
const TOOL_SPECS: [(&str, &str); 9] = [
    (
        "get_candidate_profile",
        "Get the candidate's profile: role, assessment history, pending skills and quiz status.",
    ),
    (
        "update_candidate_role",
        "Record the job role the candidate is applying for (and their name, if known).",
    ),
    (
        "start_skill_assessment",
        "Start a free-form skill assessment that you will grade yourself.",
    ),
    (
        "complete_skill_assessment",
        "Finish the free-form skill assessment in progress with a score and grade.",
    ),
    (
        "start_quiz",
        "Start a quiz. Returns the first question line, which must be shown to the candidate verbatim.",
    ),
    (
        "answer_quiz_question",
        "Submit the candidate's answer to the current quiz question.",
    ),
    (
        "record_quiz_result",
        "Record your judgement of an answer when answer_quiz_question asked you to judge it.",
    ),
    ("get_quiz_status", "Get the current quiz question and score."),
    (
        "get_verdict",
        "Compute the hiring verdict from the candidate's results and the role's requirements.",
    ),
];

fn parameters_for(name: &str) -> Result<Value> {
    let schema = match name {
        "update_candidate_role" => serde_json::to_value(schemars::schema_for!(UpdateRoleArgs))?,
        "start_skill_assessment" => serde_json::to_value(schemars::schema_for!(StartSkillArgs))?,
        "complete_skill_assessment" => {
            serde_json::to_value(schemars::schema_for!(CompleteSkillArgs))?
        }
        "start_quiz" => serde_json::to_value(schemars::schema_for!(StartQuizArgs))?,
        "answer_quiz_question" => serde_json::to_value(schemars::schema_for!(AnswerArgs))?,
        "record_quiz_result" => serde_json::to_value(schemars::schema_for!(RecordResultArgs))?,
        _ => json!({ "type": "object", "properties": {} }),
    };
    Ok(schema)
}

/// The tool list offered to the model at `stage`. Practice conversations
/// only get read access to the profile.
pub fn tool_definitions(stage: FlowStage) -> Result<Vec<ChatCompletionTool>> {
    TOOL_SPECS
        .iter()
        .filter(|(name, _)| stage != FlowStage::Practice || *name == "get_candidate_profile")
        .map(|(name, description)| {
            Ok(ChatCompletionToolArgs::default()
                .function(
                    FunctionObjectArgs::default()
                        .name(*name)
                        .description(*description)
                        .parameters(parameters_for(name)?)
                        .build()?,
                )
                .build()?)
        })
        .collect()
}

/// Maps a quiz accuracy percentage onto a grade.
pub fn grade_for(accuracy: f64) -> &'static str {
    match accuracy {
        a if a >= 85.0 => "Excellent",
        a if a >= 70.0 => "Good",
        a if a >= 50.0 => "Fair",
        _ => "Poor",
    }
}

// --- Tool execution ---

/// Executes tool calls against a staged session.
pub struct AssessmentTools<'a> {
    pub session: &'a mut Session,
    pub bank: &'a QuestionBank,
    pub competency: &'a CompetencyTable,
    pub evaluator: &'a dyn AnswerEvaluator,
    pub effects: &'a mut Vec<ProfileEffect>,
}

impl AssessmentTools<'_> {
    /// Runs the named tool and returns the text to hand back to the model.
    pub fn dispatch(&mut self, name: &str, arguments: &str) -> String {
        info!(tool = name, "Executing tool");
        let result = match name {
            "get_candidate_profile" => self.get_candidate_profile(),
            "update_candidate_role" => parse(arguments).and_then(|a| self.update_candidate_role(a)),
            "start_skill_assessment" => {
                parse(arguments).and_then(|a| self.start_skill_assessment(a))
            }
            "complete_skill_assessment" => {
                parse(arguments).and_then(|a| self.complete_skill_assessment(a))
            }
            "start_quiz" => parse_or_default(arguments).and_then(|a| self.start_quiz(a)),
            "answer_quiz_question" => parse(arguments).and_then(|a| self.answer_quiz_question(a)),
            "record_quiz_result" => parse(arguments).and_then(|a| self.record_quiz_result(a)),
            "get_quiz_status" => self.get_quiz_status(),
            "get_verdict" => self.get_verdict(),
            other => Err(format!("Unknown tool '{other}'.")),
        };
        result.unwrap_or_else(|message| {
            warn!(tool = name, error = %message, "Tool call rejected");
            json!({ "error": message }).to_string()
        })
    }

    /// Returns a snapshot of the candidate and the current quiz.
    pub fn get_candidate_profile(&self) -> Result<String, String> {
        let candidate = &self.session.candidate;
        let quiz = self.session.quiz.active().map(|engine| {
            json!({
                "kind": engine.kind(),
                "score": engine.score(),
                "current_question": engine.current_view().map(|v| v.render()),
            })
        });
        Ok(json!({
            "candidate_id": candidate.candidate_id(),
            "name": candidate.name(),
            "role_identified": candidate.role_identified(),
            "target_role": candidate.target_role(),
            "known_roles": self.competency.role_names().collect::<Vec<_>>(),
            "current_assessment": candidate.current_assessment(),
            "assessment_status": candidate.assessment_status(),
            "skill_levels": candidate.skill_levels(),
            "assessment_history": candidate.assessment_history(),
            "pending_skills": candidate.session_metadata().pending_skills,
            "stage": self.session.stage,
            "active_quiz": quiz,
            "next_planned_quiz": self.session.next_planned(),
        })
        .to_string())
    }

    /// Sets the candidate's role. Known roles are stored under their
    /// canonical name and load the role's assessment plan.
    pub fn update_candidate_role(&mut self, args: UpdateRoleArgs) -> Result<String, String> {
        let requested = args.role.trim();
        if requested.is_empty() {
            return Err("Role must not be empty.".to_string());
        }
        let (role, plan) = match self.competency.role(requested) {
            Some((name, requirements)) => (name.to_string(), requirements.assessment_plan.clone()),
            None => (requested.to_string(), Vec::new()),
        };

        if let Some(name) = args.name.as_deref().filter(|n| !n.trim().is_empty()) {
            self.session.candidate.set_name(name);
        }
        let changed = self.session.candidate.target_role() != Some(role.as_str());
        self.session.candidate.update_role(&role);
        if changed || self.session.plan.is_empty() {
            self.session.set_plan(plan.clone());
        }
        self.effects.push(ProfileEffect::RoleSelected(role.clone()));
        info!(role = %role, known = !plan.is_empty(), "Candidate role updated");

        Ok(json!({
            "status": "ok",
            "role": role,
            "known_role": self.competency.role(&role).is_some(),
            "assessment_plan": self.session.plan,
        })
        .to_string())
    }

    /// Opens a free-form assessment the model grades itself.
    pub fn start_skill_assessment(&mut self, args: StartSkillArgs) -> Result<String, String> {
        let skill = args.skill_name.trim();
        if QuizKind::from_skill_name(skill).is_some() {
            return Err(format!(
                "'{skill}' is assessed with a quiz. Use start_quiz instead."
            ));
        }
        self.session
            .candidate
            .start_assessment(skill)
            .map_err(|e| e.to_string())?;
        self.effects.push(ProfileEffect::Progress {
            skill: skill.to_string(),
            module_id: module_id_for(skill),
            status: ProgressStatus::InProgress,
        });
        Ok(format!("OK. Assessment for '{skill}' started."))
    }

    /// Closes the free-form assessment in progress.
    pub fn complete_skill_assessment(&mut self, args: CompleteSkillArgs) -> Result<String, String> {
        let skill = args.skill_name.trim();
        if let Some(engine) = self.session.quiz.active() {
            return Err(format!(
                "A {} quiz is still running. Finish it before completing assessments.",
                engine.kind()
            ));
        }
        self.session
            .candidate
            .complete_assessment(
                skill,
                args.score,
                args.grade.trim(),
                args.details.unwrap_or(Value::Null),
            )
            .map_err(|e| e.to_string())?;
        self.effects.push(ProfileEffect::Progress {
            skill: skill.to_string(),
            module_id: module_id_for(skill),
            status: ProgressStatus::Completed,
        });
        Ok(format!(
            "OK. Assessment for '{skill}' completed with score {} ({}).",
            args.score, args.grade
        ))
    }

    /// Starts a quiz of the requested kind, or the next planned one.
    pub fn start_quiz(&mut self, args: StartQuizArgs) -> Result<String, String> {
        if let Some(engine) = self.session.quiz.active() {
            let current = engine.current_view().map(|v| v.render()).unwrap_or_default();
            return Err(format!(
                "A {} quiz is already active. Use answer_quiz_question instead. Current question: {current}",
                engine.kind()
            ));
        }
        let kind = args
            .kind
            .or_else(|| self.session.next_planned())
            .ok_or_else(|| "No quiz kind given and no planned quiz remains.".to_string())?;
        let view = self.begin_quiz(kind)?;
        Ok(json!({
            "action": "quiz_started",
            "kind": kind,
            "question": view,
            "instructions": "Show the question line exactly as given, including any [Image: ...] annotations.",
        })
        .to_string())
    }

    fn begin_quiz(&mut self, kind: QuizKind) -> Result<String, String> {
        let skill = kind.skill_name();
        let questions = self
            .bank
            .questions_for(kind, self.session.question_pool());
        if questions.is_empty() {
            return Err(QuizError::EmptyQuestionSet.to_string());
        }

        match self.session.candidate.current_assessment() {
            None => self
                .session
                .candidate
                .start_assessment(skill)
                .map_err(|e| e.to_string())?,
            Some(current) if current == skill => {}
            Some(current) => {
                return Err(format!(
                    "An assessment for '{current}' is in progress. Complete it first."
                ));
            }
        }
        let view = match self.session.quiz.start(kind, questions) {
            Ok(view) => view,
            Err(e) => return Err(e.to_string()),
        };
        self.effects.push(ProfileEffect::Progress {
            skill: skill.to_string(),
            module_id: kind.module_id().to_string(),
            status: ProgressStatus::InProgress,
        });
        info!(kind = %kind, total = view.total, "Quiz started");
        Ok(view.render())
    }

    /// Submits an answer. Exact questions are scored immediately; semantic
    /// questions are handed back for judgement.
    pub fn answer_quiz_question(&mut self, args: AnswerArgs) -> Result<String, String> {
        let request = self
            .session
            .quiz
            .submit_answer(&args.answer)
            .map_err(|e| e.to_string())?;
        let key = AnswerKey {
            expected: &request.expected_answer,
            accepted: &request.accepted_answers,
        };
        match self
            .evaluator
            .evaluate(request.policy, key, &request.raw_answer)
        {
            Evaluation::Decided(is_correct) => self.advance(is_correct, Some(&request.expected_answer)),
            Evaluation::Delegated => Ok(json!({
                "action": "judge_answer",
                "question": request.prompt,
                "candidate_answer": request.raw_answer,
                "expected_answer": request.expected_answer,
                "instructions": "Decide whether the candidate's answer means the same as the expected answer, then call record_quiz_result.",
            })
            .to_string()),
        }
    }

    /// Applies the model's judgement to a delegated answer.
    pub fn record_quiz_result(&mut self, args: RecordResultArgs) -> Result<String, String> {
        let engine = self
            .session
            .quiz
            .active()
            .ok_or_else(|| "No quiz is active.".to_string())?;
        let question = engine
            .current_question()
            .ok_or_else(|| "No quiz is active.".to_string())?;
        if question.policy != AnswerPolicy::DelegatedSemanticCompare {
            return Err(
                "This question is scored automatically by answer_quiz_question.".to_string(),
            );
        }
        if engine.pending_answer().is_none() {
            return Err("Call answer_quiz_question with the candidate's answer first.".to_string());
        }
        let expected = question.expected_answer.clone();
        self.advance(args.is_correct, Some(&expected))
    }

    fn advance(&mut self, is_correct: bool, expected: Option<&str>) -> Result<String, String> {
        let outcome = self
            .session
            .quiz
            .record_result(is_correct)
            .map_err(|e| e.to_string())?;
        match outcome {
            StepOutcome::Next(view) => Ok(json!({
                "action": "next_question",
                "was_correct": is_correct,
                "correct_answer": expected,
                "question": view.render(),
            })
            .to_string()),
            StepOutcome::Completed(summary) => self.finish_quiz(is_correct, summary),
        }
    }

    fn finish_quiz(&mut self, last_correct: bool, summary: CompletionSummary) -> Result<String, String> {
        let kind = summary.kind;
        let skill = kind.skill_name();
        let grade = grade_for(summary.accuracy);
        let details = json!({
            "score": summary.score,
            "total": summary.total,
            "accuracy": summary.accuracy,
            "results": summary.results,
        });
        self.session
            .candidate
            .complete_assessment(skill, summary.accuracy, grade, details)
            .map_err(|e| e.to_string())?;
        self.effects.push(ProfileEffect::Progress {
            skill: skill.to_string(),
            module_id: kind.module_id().to_string(),
            status: ProgressStatus::Completed,
        });
        info!(kind = %kind, score = summary.score, total = summary.total, "Quiz completed");

        let next_question = match self.session.next_planned() {
            Some(next) => match self.begin_quiz(next) {
                Ok(question) => Some(question),
                Err(e) => {
                    warn!(kind = %next, error = %e, "Could not start the next planned quiz");
                    None
                }
            },
            None => None,
        };
        Ok(json!({
            "action": "quiz_completed",
            "was_correct": last_correct,
            "kind": kind,
            "score": summary.score,
            "total": summary.total,
            "accuracy": summary.accuracy,
            "grade": grade,
            "next_quiz_question": next_question,
        })
        .to_string())
    }

    pub fn get_quiz_status(&self) -> Result<String, String> {
        let status = match self.session.quiz.engine() {
            Some(engine) => json!({
                "kind": engine.kind(),
                "active": engine.is_active(),
                "score": engine.score(),
                "answered": engine.results().len(),
                "total": engine.total(),
                "current_question": engine.current_view().map(|v| v.render()),
            }),
            None => json!({ "active": false }),
        };
        Ok(status.to_string())
    }

    pub fn get_verdict(&self) -> Result<String, String> {
        let candidate = &self.session.candidate;
        let verdict = calculate_verdict(
            candidate.assessment_history(),
            self.competency,
            candidate.target_role(),
        );
        serde_json::to_string(&verdict).map_err(|e| format!("Failed to serialize verdict: {e}"))
    }
}

fn module_id_for(skill: &str) -> String {
    skill
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn parse<T: DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| format!("Invalid arguments: {e}"))
}

fn parse_or_default<T: DeserializeOwned + Default>(arguments: &str) -> Result<T, String> {
    if arguments.trim().is_empty() {
        return Ok(T::default());
    }
    parse(arguments)
}
