//! Builds the system prompt for a turn from a template and the session.

use crate::classifier::{COMPLETION_MARKER, CONTINUATION_MARKER};
use crate::session::{FlowStage, Session};
use crate::verdict::CompetencyTable;
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Prompt templates keyed by purpose.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub assessment: String,
    pub practice: String,
}

impl PromptSet {
    /// Picks the templates out of a map of prompt files keyed by file stem.
    /// `system_prompt` is required; `practice_prompt` falls back to it.
    pub fn from_map(prompts: &HashMap<String, String>) -> Result<Self> {
        let assessment = prompts
            .get("system_prompt")
            .cloned()
            .context("system_prompt.md not found in prompts directory")?;
        let practice = prompts
            .get("practice_prompt")
            .cloned()
            .unwrap_or_else(|| assessment.clone());
        Ok(Self {
            assessment,
            practice,
        })
    }
}

#[derive(Serialize)]
struct TurnContext<'a> {
    candidate_id: &'a str,
    name: Option<&'a str>,
    target_role: Option<&'a str>,
    stage: FlowStage,
    current_assessment: Option<&'a str>,
    skill_levels: &'a BTreeMap<String, f64>,
    pending_skills: &'a [String],
    completed_skills: &'a [String],
    active_quiz: Option<Value>,
}

/// Renders `template` for `session`.
///
/// `{placeholder}` values are substituted first, then a JSON block with the
/// live session context is appended.
pub fn render(template: &str, session: &Session, competency: &CompetencyTable) -> Result<String> {
    let candidate = &session.candidate;
    let roles = competency.role_names().collect::<Vec<_>>().join(", ");
    let substitutions = [
        ("{candidate_name}", candidate.name().unwrap_or("the candidate")),
        ("{target_role}", candidate.target_role().unwrap_or("not yet identified")),
        ("{available_roles}", roles.as_str()),
        ("{completion_marker}", COMPLETION_MARKER),
        ("{continuation_marker}", CONTINUATION_MARKER),
    ];
    let body = substitutions
        .iter()
        .fold(template.to_string(), |text, (key, value)| text.replace(*key, value));

    let metadata = candidate.session_metadata();
    let context = TurnContext {
        candidate_id: candidate.candidate_id(),
        name: candidate.name(),
        target_role: candidate.target_role(),
        stage: session.stage,
        current_assessment: candidate.current_assessment(),
        skill_levels: candidate.skill_levels(),
        pending_skills: &metadata.pending_skills,
        completed_skills: &metadata.completed_skills,
        active_quiz: session.quiz.active().map(|engine| {
            serde_json::json!({
                "kind": engine.kind(),
                "score": engine.score(),
                "current_question": engine.current_view().map(|v| v.render()),
                "awaiting_judgement": engine.pending_answer().is_some(),
            })
        }),
    };
    let context_json = serde_json::to_string_pretty(&context)?;

    Ok(format!(
        "{body}\n\n# Current Context for This Turn\n\n**Candidate Status:**\n```json\n{context_json}\n```"
    ))
}
